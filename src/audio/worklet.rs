//! # Realtime Rendering Unit
//!
//! The delegated playback path hands fragments to a `WorkletProcessor` that
//! lives inside the audio graph and renders them back to back on the audio
//! clock. The scheduler only talks to it through its message channels.
//!
//! ## Per-quantum processing:
//! 1. Drain pending commands (`Enqueue`, `Clear`, `FadeOut`, `End`)
//! 2. Render queued clips gaplessly into the output quantum
//! 3. Report clip starts, queue length changes and the end of the queue

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::graph::{WorkletCommand, WorkletEvent, WorkletPort};

struct QueuedClip {
    utterance_id: String,
    fragment_index: u32,
    samples: Arc<[f32]>,
}

struct Fade {
    remaining: usize,
    total: usize,
}

pub struct WorkletProcessor {
    sample_rate: u32,
    commands: mpsc::UnboundedReceiver<WorkletCommand>,
    events: mpsc::UnboundedSender<WorkletEvent>,
    queue: VecDeque<QueuedClip>,
    /// Read position inside the front clip
    position: usize,
    front_announced: bool,
    fade: Option<Fade>,
    closed: bool,
}

impl WorkletProcessor {
    /// Create a processor and the port the scheduler uses to drive it.
    pub fn new(sample_rate: u32) -> (Self, WorkletPort) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let processor = Self {
            sample_rate,
            commands: command_rx,
            events: event_tx,
            queue: VecDeque::new(),
            position: 0,
            front_announced: false,
            fade: None,
            closed: false,
        };
        let port = WorkletPort {
            commands: command_tx,
            events: event_rx,
        };
        (processor, port)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    /// Mix one quantum of output into `out`. Returns `false` once closed.
    pub fn process(&mut self, out: &mut [f32]) -> bool {
        self.drain_commands();
        if self.closed {
            return false;
        }

        for frame in out.iter_mut() {
            let gain = self.next_fade_gain();
            let Some(clip) = self.queue.front() else { break };

            if !self.front_announced {
                self.front_announced = true;
                self.emit(WorkletEvent::ClipStarted {
                    utterance_id: clip.utterance_id.clone(),
                    fragment_index: clip.fragment_index,
                });
            }

            if let Some(sample) = clip.samples.get(self.position) {
                *frame += sample * gain;
            }
            self.position += 1;

            if self.position >= clip.samples.len() {
                self.advance();
            }
        }

        true
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if self.closed {
                continue;
            }
            match command {
                WorkletCommand::Enqueue {
                    utterance_id,
                    fragment_index,
                    samples,
                } => {
                    if samples.is_empty() {
                        continue;
                    }
                    self.queue.push_back(QueuedClip {
                        utterance_id,
                        fragment_index,
                        samples,
                    });
                    self.emit(WorkletEvent::QueueLength(self.queue.len()));
                }
                WorkletCommand::Clear => {
                    self.queue.clear();
                    self.position = 0;
                    self.front_announced = false;
                    self.fade = None;
                    self.emit(WorkletEvent::QueueLength(0));
                }
                WorkletCommand::FadeOut { duration_ms } => {
                    let total = (duration_ms * self.sample_rate as u64 / 1000).max(1) as usize;
                    self.fade = Some(Fade {
                        remaining: total,
                        total,
                    });
                }
                WorkletCommand::End => {
                    self.queue.clear();
                    self.closed = true;
                    debug!("Rendering unit closed");
                    self.emit(WorkletEvent::Closed);
                }
            }
        }
    }

    fn advance(&mut self) {
        self.queue.pop_front();
        self.position = 0;
        self.front_announced = false;
        self.emit(WorkletEvent::QueueLength(self.queue.len()));
        if self.queue.is_empty() {
            self.emit(WorkletEvent::Ended);
        }
    }

    fn next_fade_gain(&mut self) -> f32 {
        match self.fade.as_mut() {
            Some(fade) => {
                let gain = fade.remaining as f32 / fade.total as f32;
                fade.remaining = fade.remaining.saturating_sub(1);
                gain
            }
            None => 1.0,
        }
    }

    fn emit(&self, event: WorkletEvent) {
        // The scheduler may already be gone during teardown
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(port: &WorkletPort, id: &str, index: u32, samples: Vec<f32>) {
        port.commands
            .send(WorkletCommand::Enqueue {
                utterance_id: id.to_string(),
                fragment_index: index,
                samples: samples.into(),
            })
            .unwrap();
    }

    fn drain(port: &mut WorkletPort) -> Vec<WorkletEvent> {
        let mut events = Vec::new();
        while let Ok(event) = port.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_clips_render_back_to_back() {
        let (mut processor, mut port) = WorkletProcessor::new(1_000);
        enqueue(&port, "utt", 0, vec![0.1, 0.2, 0.3]);
        enqueue(&port, "utt", 1, vec![0.4, 0.5]);

        let mut out = vec![0.0; 8];
        assert!(processor.process(&mut out));
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.0, 0.0, 0.0]);

        let events = drain(&mut port);
        assert_eq!(
            events,
            vec![
                WorkletEvent::QueueLength(1),
                WorkletEvent::QueueLength(2),
                WorkletEvent::ClipStarted {
                    utterance_id: "utt".to_string(),
                    fragment_index: 0
                },
                WorkletEvent::QueueLength(1),
                WorkletEvent::ClipStarted {
                    utterance_id: "utt".to_string(),
                    fragment_index: 1
                },
                WorkletEvent::QueueLength(0),
                WorkletEvent::Ended,
            ]
        );
    }

    #[test]
    fn test_clip_spans_quanta() {
        let (mut processor, mut port) = WorkletProcessor::new(1_000);
        enqueue(&port, "utt", 0, vec![1.0; 6]);

        let mut first = vec![0.0; 4];
        processor.process(&mut first);
        assert_eq!(processor.queue_length(), 1);
        let mut second = vec![0.0; 4];
        processor.process(&mut second);
        assert_eq!(second, vec![1.0, 1.0, 0.0, 0.0]);
        assert!(drain(&mut port).contains(&WorkletEvent::Ended));
    }

    #[test]
    fn test_clear_drops_queue() {
        let (mut processor, mut port) = WorkletProcessor::new(1_000);
        enqueue(&port, "utt", 0, vec![1.0; 16]);
        let mut out = vec![0.0; 4];
        processor.process(&mut out);
        drain(&mut port);

        port.commands.send(WorkletCommand::Clear).unwrap();
        let mut out = vec![0.0; 4];
        processor.process(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(drain(&mut port), vec![WorkletEvent::QueueLength(0)]);
    }

    #[test]
    fn test_fade_out_then_end() {
        let (mut processor, mut port) = WorkletProcessor::new(1_000);
        enqueue(&port, "utt", 0, vec![1.0; 32]);
        port.commands
            .send(WorkletCommand::FadeOut { duration_ms: 4 })
            .unwrap();

        let mut out = vec![0.0; 6];
        processor.process(&mut out);
        assert_eq!(out, vec![1.0, 0.75, 0.5, 0.25, 0.0, 0.0]);

        port.commands.send(WorkletCommand::End).unwrap();
        let mut out = vec![0.0; 4];
        assert!(!processor.process(&mut out));
        assert!(processor.is_closed());
        assert!(drain(&mut port).contains(&WorkletEvent::Closed));
    }
}
