//! # Visualization Store
//!
//! Rate-limited broadcast buffer for 24-band visualization data. Writers may
//! push values hundreds of times per second; subscribers are notified at most
//! once per display frame.
//!
//! ## How coalescing works:
//! - **write**: copies into a fixed scratch array and, if no flush is pending,
//!   requests exactly one flush on the next display frame
//! - **flush**: runs only when dirty, publishes a new immutable snapshot and
//!   notifies every subscriber
//! - **clear**: zeroes the scratch and flushes synchronously, bypassing the
//!   frame schedule so silence is immediate
//!
//! Snapshots are `Arc<[f32; 24]>` replaced wholesale on every publish, so
//! `Arc::ptr_eq` tells a consumer whether anything changed. The scratch
//! array never leaves the store.
//!
//! Each session owns two stores (microphone and playback); nothing here is
//! global.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::bands::BAND_COUNT;

/// Immutable published band vector.
pub type Snapshot = Arc<[f32; BAND_COUNT]>;

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Something that wants to run once on the next display frame.
pub trait FrameTarget: Send + Sync {
    fn on_frame(&self);
}

/// Source of display frames.
pub trait FrameScheduler: Send + Sync {
    /// Run `target.on_frame()` once on the next frame.
    fn request_frame(&self, target: Arc<dyn FrameTarget>);
}

/// Display-frame clock driven by a tokio interval.
pub struct FrameTicker {
    pending: Mutex<Vec<Arc<dyn FrameTarget>>>,
    spare: Mutex<Vec<Arc<dyn FrameTarget>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTicker {
    /// Start ticking every `interval` on the current tokio runtime.
    pub fn spawn(interval: Duration) -> Arc<Self> {
        let ticker = Arc::new(Self {
            pending: Mutex::new(Vec::with_capacity(4)),
            spare: Mutex::new(Vec::with_capacity(4)),
            task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&ticker);
        let handle = tokio::spawn(async move {
            let mut clock = tokio::time::interval(interval);
            clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                clock.tick().await;
                match weak.upgrade() {
                    Some(ticker) => ticker.run_frame(),
                    None => break,
                }
            }
        });
        *ticker.task.lock() = Some(handle);
        ticker
    }

    fn run_frame(&self) {
        let mut batch = std::mem::take(&mut *self.spare.lock());
        std::mem::swap(&mut batch, &mut *self.pending.lock());
        for target in batch.drain(..) {
            target.on_frame();
        }
        *self.spare.lock() = batch;
    }
}

impl FrameScheduler for FrameTicker {
    fn request_frame(&self, target: Arc<dyn FrameTarget>) {
        self.pending.lock().push(target);
    }
}

impl Drop for FrameTicker {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// Frame source advanced explicitly by its owner (headless hosts, tests).
#[derive(Default)]
pub struct ManualFrameScheduler {
    pending: Mutex<Vec<Arc<dyn FrameTarget>>>,
}

impl ManualFrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every target queued for this frame. Returns how many ran.
    pub fn advance_frame(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let count = batch.len();
        for target in batch {
            target.on_frame();
        }
        count
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.lock().len()
    }
}

impl FrameScheduler for ManualFrameScheduler {
    fn request_frame(&self, target: Arc<dyn FrameTarget>) {
        self.pending.lock().push(target);
    }
}

struct StoreState {
    scratch: [f32; BAND_COUNT],
    dirty: bool,
    frame_pending: bool,
    snapshot: Snapshot,
}

struct StoreShared {
    state: Mutex<StoreState>,
    // Copy-on-write so a flush can iterate without holding the lock
    listeners: Mutex<Arc<Vec<(u64, Listener)>>>,
    next_listener_id: AtomicU64,
    frames: Arc<dyn FrameScheduler>,
}

impl StoreShared {
    fn flush(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            let snapshot = Arc::new(state.scratch);
            state.snapshot = Arc::clone(&snapshot);
            snapshot
        };

        let listeners = Arc::clone(&*self.listeners.lock());
        for (_, listener) in listeners.iter() {
            listener(&snapshot);
        }
    }

    fn remove_listener(&self, id: u64) {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|(existing, _)| *existing == id) {
            let remaining = listeners
                .iter()
                .filter(|(existing, _)| *existing != id)
                .cloned()
                .collect();
            *listeners = Arc::new(remaining);
        }
    }
}

impl FrameTarget for StoreShared {
    fn on_frame(&self) {
        self.state.lock().frame_pending = false;
        self.flush();
    }
}

/// Coalescing publisher of visualization snapshots.
#[derive(Clone)]
pub struct VisualizationStore {
    shared: Arc<StoreShared>,
}

impl VisualizationStore {
    pub fn new(frames: Arc<dyn FrameScheduler>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    scratch: [0.0; BAND_COUNT],
                    dirty: false,
                    frame_pending: false,
                    snapshot: Arc::new([0.0; BAND_COUNT]),
                }),
                listeners: Mutex::new(Arc::new(Vec::new())),
                next_listener_id: AtomicU64::new(1),
                frames,
            }),
        }
    }

    /// Copy `values` into the store; subscribers see them on the next frame.
    ///
    /// Values beyond 24 are ignored and missing values are written as 0.
    pub fn write(&self, values: &[f32]) {
        let request = {
            let mut state = self.shared.state.lock();
            let count = values.len().min(BAND_COUNT);
            state.scratch[..count].copy_from_slice(&values[..count]);
            state.scratch[count..].fill(0.0);
            state.dirty = true;
            if state.frame_pending {
                false
            } else {
                state.frame_pending = true;
                true
            }
        };

        if request {
            let target: Arc<dyn FrameTarget> = self.shared.clone();
            self.shared.frames.request_frame(target);
        }
    }

    /// Publish silence immediately.
    pub fn clear(&self) {
        {
            let mut state = self.shared.state.lock();
            state.scratch.fill(0.0);
            state.dirty = true;
        }
        self.shared.flush();
    }

    /// Current published snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.shared.state.lock().snapshot)
    }

    /// Register a listener called with every published snapshot.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.shared.listeners.lock();
        let mut updated: Vec<(u64, Listener)> = listeners.iter().cloned().collect();
        updated.push((id, Arc::new(listener)));
        *listeners = Arc::new(updated);

        Subscription {
            store: Arc::downgrade(&self.shared),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }
}

/// Handle returned by [`VisualizationStore::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    store: Weak<StoreShared>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.remove_listener(self.id);
        }
    }
}
