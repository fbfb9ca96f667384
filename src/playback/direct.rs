//! Direct playback: the scheduler owns the FIFO and chains one buffer
//! source after another on natural completion.

use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{PlaybackEvent, PlaybackStrategy};
use crate::audio::fragment::AudioFragment;
use crate::audio::graph::{AudioGraph, SourceNode};
use crate::error::AudioError;

struct QueueEntry {
    utterance_id: String,
    fragment_index: u32,
    samples: Arc<[f32]>,
}

struct DirectState {
    queue: VecDeque<QueueEntry>,
    current: Option<Box<dyn SourceNode>>,
    /// Bumped for every started source and on stop; completion callbacks
    /// carrying an older value are ignored.
    generation: u64,
    playing: bool,
}

impl DirectState {
    fn queue_length(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }
}

struct DirectShared {
    graph: Arc<dyn AudioGraph>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    state: Mutex<DirectState>,
}

impl DirectShared {
    fn emit(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    /// Start the next queued entry, skipping entries the graph rejects.
    fn start_next(self: &Arc<Self>, state: &mut DirectState) {
        while let Some(entry) = state.queue.pop_front() {
            state.generation += 1;
            let generation = state.generation;
            let shared: Weak<Self> = Arc::downgrade(self);
            let on_ended = Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_source_ended(generation);
                }
            });

            match self.graph.start_source(entry.samples, on_ended) {
                Ok(node) => {
                    state.current = Some(node);
                    state.playing = true;
                    if entry.fragment_index == 0 {
                        self.emit(PlaybackEvent::Started {
                            utterance_id: entry.utterance_id,
                        });
                    }
                    self.emit(PlaybackEvent::QueueLength(state.queue_length()));
                    return;
                }
                Err(e) => {
                    warn!(
                        utterance_id = %entry.utterance_id,
                        fragment_index = entry.fragment_index,
                        error = %e,
                        "Failed to start buffer source"
                    );
                    self.emit(PlaybackEvent::Error(e));
                }
            }
        }

        state.current = None;
        self.emit(PlaybackEvent::QueueLength(0));
        if state.playing {
            state.playing = false;
            self.emit(PlaybackEvent::Stopped);
        }
    }

    fn on_source_ended(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(generation, "Ignoring completion of a stopped source");
            return;
        }
        state.current = None;
        self.start_next(&mut state);
    }
}

pub struct DirectStrategy {
    shared: Arc<DirectShared>,
}

impl DirectStrategy {
    pub fn new(graph: Arc<dyn AudioGraph>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            shared: Arc::new(DirectShared {
                graph,
                events,
                state: Mutex::new(DirectState {
                    queue: VecDeque::new(),
                    current: None,
                    generation: 0,
                    playing: false,
                }),
            }),
        }
    }
}

impl PlaybackStrategy for DirectStrategy {
    fn enqueue(&self, fragment: AudioFragment) -> Result<(), AudioError> {
        let mut state = self.shared.state.lock();
        state.queue.push_back(QueueEntry {
            utterance_id: fragment.utterance_id,
            fragment_index: fragment.fragment_index,
            samples: fragment.samples,
        });

        if state.current.is_none() {
            self.shared.start_next(&mut state);
        } else {
            self.shared
                .emit(PlaybackEvent::QueueLength(state.queue_length()));
        }
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        if let Some(mut node) = state.current.take() {
            node.disconnect();
        }
        state.queue.clear();
        self.shared.emit(PlaybackEvent::QueueLength(0));
        if state.playing {
            state.playing = false;
            self.shared.emit(PlaybackEvent::Stopped);
        }
    }

    fn queue_length(&self) -> usize {
        self.shared.state.lock().queue_length()
    }

    fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    fn finish(&self) -> BoxFuture<'static, ()> {
        self.stop();
        future::ready(()).boxed()
    }
}
