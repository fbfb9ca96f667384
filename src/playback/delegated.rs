//! Delegated playback: fragments are relayed to the graph's realtime
//! rendering unit, and its reports are pumped back into playback events.

use futures_util::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PlaybackEvent, PlaybackStrategy};
use crate::audio::fragment::AudioFragment;
use crate::audio::graph::{AudioGraph, WorkletCommand, WorkletEvent, WorkletPort};
use crate::config::PlaybackConfig;
use crate::error::AudioError;

#[derive(Default)]
struct DelegatedShared {
    queue_length: AtomicUsize,
    playing: AtomicBool,
    closed: AtomicBool,
    /// `Clear` commands the rendering unit has not acknowledged yet
    pending_clears: AtomicUsize,
}

pub struct DelegatedStrategy {
    commands: mpsc::UnboundedSender<WorkletCommand>,
    shared: Arc<DelegatedShared>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    pump: JoinHandle<()>,
    fade_out: Duration,
    close_confirm_attempts: u32,
    close_confirm_interval: Duration,
}

impl DelegatedStrategy {
    /// Load the rendering unit into `graph` and start pumping its events.
    pub fn start(
        graph: Arc<dyn AudioGraph>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
        config: &PlaybackConfig,
    ) -> Result<Self, AudioError> {
        let WorkletPort {
            commands,
            events: worklet_events,
        } = graph.load_worklet()?;

        let shared = Arc::new(DelegatedShared::default());
        let pump = tokio::spawn(Self::pump(worklet_events, shared.clone(), events.clone()));

        Ok(Self {
            commands,
            shared,
            events,
            pump,
            fade_out: config.fade_out(),
            close_confirm_attempts: config.close_confirm_attempts,
            close_confirm_interval: config.close_confirm_interval(),
        })
    }

    async fn pump(
        mut worklet_events: mpsc::UnboundedReceiver<WorkletEvent>,
        shared: Arc<DelegatedShared>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) {
        while let Some(event) = worklet_events.recv().await {
            if shared.pending_clears.load(Ordering::SeqCst) > 0 {
                // Reports queued before a `Clear` describe discarded clips
                match event {
                    WorkletEvent::QueueLength(0) => {
                        shared.pending_clears.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    WorkletEvent::Closed => {}
                    _ => continue,
                }
            }

            match event {
                WorkletEvent::ClipStarted {
                    utterance_id,
                    fragment_index,
                } => {
                    shared.playing.store(true, Ordering::SeqCst);
                    if fragment_index == 0 {
                        let _ = events.send(PlaybackEvent::Started { utterance_id });
                    }
                }
                WorkletEvent::Ended => {
                    if shared.playing.swap(false, Ordering::SeqCst) {
                        let _ = events.send(PlaybackEvent::Stopped);
                    }
                }
                WorkletEvent::QueueLength(length) => {
                    shared.queue_length.store(length, Ordering::SeqCst);
                    let _ = events.send(PlaybackEvent::QueueLength(length));
                    if length == 0 && shared.playing.swap(false, Ordering::SeqCst) {
                        let _ = events.send(PlaybackEvent::Stopped);
                    }
                }
                WorkletEvent::Closed => {
                    shared.closed.store(true, Ordering::SeqCst);
                    debug!("Rendering unit confirmed close");
                    break;
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl PlaybackStrategy for DelegatedStrategy {
    fn enqueue(&self, fragment: AudioFragment) -> Result<(), AudioError> {
        self.commands
            .send(WorkletCommand::Enqueue {
                utterance_id: fragment.utterance_id,
                fragment_index: fragment.fragment_index,
                samples: fragment.samples,
            })
            .map_err(|_| AudioError::WorkletUnavailable("rendering unit is gone".to_string()))
    }

    fn stop(&self) {
        if self.commands.send(WorkletCommand::Clear).is_ok() {
            self.shared.pending_clears.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.queue_length.store(0, Ordering::SeqCst);
        let _ = self.events.send(PlaybackEvent::QueueLength(0));
        if self.shared.playing.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(PlaybackEvent::Stopped);
        }
    }

    fn queue_length(&self) -> usize {
        self.shared.queue_length.load(Ordering::SeqCst)
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    fn finish(&self) -> BoxFuture<'static, ()> {
        let commands = self.commands.clone();
        let shared = self.shared.clone();
        let fade_out = self.fade_out;
        let attempts = self.close_confirm_attempts;
        let interval = self.close_confirm_interval;
        let was_playing = self.is_playing();

        async move {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let duration_ms = fade_out.as_millis() as u64;
            if commands.send(WorkletCommand::FadeOut { duration_ms }).is_err() {
                debug!("Rendering unit already gone");
                return;
            }
            if was_playing {
                tokio::time::sleep(fade_out).await;
            }
            let _ = commands.send(WorkletCommand::End);

            for _ in 0..attempts {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
            if !shared.closed.load(Ordering::SeqCst) {
                warn!(attempts, "Rendering unit did not confirm close, continuing teardown");
            }
        }
        .boxed()
    }
}

impl Drop for DelegatedStrategy {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
