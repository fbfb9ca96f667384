//! # Audio Graph Abstraction
//!
//! The playback engine renders through an `AudioGraph`: an output gain stage,
//! one-shot buffer source nodes that report natural completion, a realtime
//! rendering unit reached over message channels, and a spectrum analyser tap.
//!
//! ## Key Types:
//! - **AudioHost**: creates graphs (one per session, or one shared graph)
//! - **AudioGraph**: a running graph; object safe so hosts can be swapped
//! - **SourceNode**: handle to a started buffer source
//! - **WorkletPort**: both ends of the channel pair of the rendering unit
//!
//! ## Rust Concepts:
//! - **`Arc<dyn AudioGraph>`**: the scheduler and the coordinator may both
//!   hold the same graph, so graphs are shared and internally synchronized
//! - **Callbacks as `Box<dyn FnOnce>`**: a completion callback runs at most
//!   once, and never for a source that was disconnected first

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::AudioError;

/// Invoked once when a source finishes playing its buffer naturally.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Messages the scheduler sends to the rendering unit.
#[derive(Debug, Clone)]
pub enum WorkletCommand {
    /// Append a fragment to the rendering unit's queue
    Enqueue {
        utterance_id: String,
        fragment_index: u32,
        samples: Arc<[f32]>,
    },
    /// Drop everything queued and go silent
    Clear,
    /// Ramp the output down to silence
    FadeOut { duration_ms: u64 },
    /// Stop processing and confirm with `WorkletEvent::Closed`
    End,
}

/// Messages the rendering unit reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkletEvent {
    /// A fragment started rendering
    ClipStarted {
        utterance_id: String,
        fragment_index: u32,
    },
    /// The queue ran dry after playing at least one fragment
    Ended,
    /// Fragments queued, including the one rendering
    QueueLength(usize),
    /// The unit processed `End` and will render nothing more
    Closed,
}

/// Scheduler-side ends of the rendering unit's channel pair.
#[derive(Debug)]
pub struct WorkletPort {
    pub commands: mpsc::UnboundedSender<WorkletCommand>,
    pub events: mpsc::UnboundedReceiver<WorkletEvent>,
}

/// A started buffer source.
pub trait SourceNode: Send {
    /// Stop the source immediately; its completion callback will never run.
    fn disconnect(&mut self);
}

/// A running audio graph.
pub trait AudioGraph: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Route output to a specific device.
    fn set_output_device(&self, device_id: &str) -> Result<(), AudioError>;

    /// Set the output gain stage (0.0..=1.0).
    fn set_gain(&self, gain: f32);

    fn gain(&self) -> f32;

    /// Start playing a buffer through the gain stage right away.
    fn start_source(
        &self,
        samples: Arc<[f32]>,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn SourceNode>, AudioError>;

    /// Load the realtime rendering unit and connect it to the gain stage.
    fn load_worklet(&self) -> Result<WorkletPort, AudioError>;

    /// Number of bins `byte_frequency_data` can fill.
    fn frequency_bin_count(&self) -> usize;

    /// Read the analyser's current spectrum as bytes into `out`.
    fn byte_frequency_data(&self, out: &mut [u8]);

    /// Release the graph's resources.
    fn close(&self) -> Result<(), AudioError>;

    fn is_closed(&self) -> bool;
}

/// Factory for audio graphs.
pub trait AudioHost: Send + Sync {
    fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, AudioError>;
}
