//! # Playback Scheduler
//!
//! Plays released audio fragments gaplessly through an audio graph and
//! samples the output spectrum for the playback visualization store.
//!
//! ## Strategies (chosen once, at initialization):
//! - **Delegated**: fragments are relayed to the graph's realtime rendering
//!   unit, which schedules them on the audio clock
//! - **Direct**: the scheduler keeps the FIFO itself and starts the next
//!   buffer source when the previous one ends
//!
//! ## Lifecycle:
//! 1. `initialize()` creates (or adopts a shared) graph and starts the strategy
//! 2. `enqueue()` appends fragments in release order; the queue never reorders
//! 3. `stop()` silences and discards everything but keeps the graph
//! 4. `stop_and_teardown()` shuts the strategy down in order and closes the
//!    graph if this scheduler created it
//!
//! Playback state changes are reported as `PlaybackEvent`s on the channel
//! returned by `PlaybackScheduler::new`.

pub mod delegated;
pub mod direct;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::bands::{self, BAND_COUNT};
use crate::audio::fragment::AudioFragment;
use crate::audio::graph::{AudioGraph, AudioHost};
use crate::audio::visualization::VisualizationStore;
use crate::config::{PlaybackConfig, PlaybackMode};
use crate::error::AudioError;

use self::delegated::DelegatedStrategy;
use self::direct::DirectStrategy;

/// Playback state changes reported by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Fragment 0 of an utterance started playing
    Started { utterance_id: String },
    /// Playback went idle (queue drained or stopped)
    Stopped,
    /// Number of fragments queued, including the one playing
    QueueLength(usize),
    /// A fragment could not be played; playback continues
    Error(AudioError),
}

/// Behavior shared by the delegated and direct playback paths.
pub trait PlaybackStrategy: Send + Sync {
    fn enqueue(&self, fragment: AudioFragment) -> Result<(), AudioError>;

    /// Halt immediately and discard everything queued.
    fn stop(&self);

    fn queue_length(&self) -> usize;

    fn is_playing(&self) -> bool;

    /// Orderly shutdown before the graph closes.
    fn finish(&self) -> BoxFuture<'static, ()>;
}

/// Scratch state of the display-rate spectrum sampler.
struct Sampler {
    graph: Arc<dyn AudioGraph>,
    strategy: Arc<dyn PlaybackStrategy>,
    store: VisualizationStore,
    bytes: Vec<u8>,
    bands: [f32; BAND_COUNT],
    was_playing: bool,
}

impl Sampler {
    fn sample(&mut self) {
        if !self.strategy.is_playing() {
            if self.was_playing {
                self.was_playing = false;
                self.store.clear();
            }
            return;
        }
        self.was_playing = true;
        self.graph.byte_frequency_data(&mut self.bytes);
        bands::reduce_into(&self.bytes, self.graph.sample_rate() as f32, &mut self.bands);
        self.store.write(&self.bands);
    }
}

struct Engine {
    graph: Arc<dyn AudioGraph>,
    owns_graph: bool,
    strategy: Arc<dyn PlaybackStrategy>,
    sampler: Arc<Mutex<Sampler>>,
    sampler_task: JoinHandle<()>,
}

struct VolumeState {
    volume: f32,
    muted: bool,
}

impl VolumeState {
    fn effective(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

/// Gapless fragment player with visualization sampling.
pub struct PlaybackScheduler {
    config: PlaybackConfig,
    store: VisualizationStore,
    frame_interval: Duration,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    engine: Mutex<Option<Engine>>,
    volume: Mutex<VolumeState>,
}

impl PlaybackScheduler {
    /// Create an uninitialized scheduler that publishes into `store`.
    pub fn new(
        config: PlaybackConfig,
        store: VisualizationStore,
        frame_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let volume = VolumeState {
            volume: config.volume.clamp(0.0, 1.0),
            muted: false,
        };
        let scheduler = Self {
            config,
            store,
            frame_interval,
            events,
            engine: Mutex::new(None),
            volume: Mutex::new(volume),
        };
        (scheduler, events_rx)
    }

    pub fn mode(&self) -> PlaybackMode {
        self.config.mode
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// Prepare the audio graph and the playback strategy.
    ///
    /// With `shared_graph` the scheduler plays through a graph owned by
    /// someone else and never closes it.
    pub fn initialize(
        &self,
        host: &dyn AudioHost,
        shared_graph: Option<Arc<dyn AudioGraph>>,
    ) -> Result<(), AudioError> {
        if self.is_initialized() {
            debug!("Playback scheduler already initialized");
            return Ok(());
        }

        let owns_graph = shared_graph.is_none();
        let graph = match shared_graph {
            Some(graph) => graph,
            None => host.create_graph().map_err(|e| match e {
                AudioError::InitializationFailure(_) => e,
                other => AudioError::InitializationFailure(other.to_string()),
            })?,
        };

        if let Some(device_id) = &self.config.output_device_id {
            if let Err(e) = graph.set_output_device(device_id) {
                warn!(device_id = %device_id, error = %e, "Failed to bind output device, using default");
            }
        }
        graph.set_gain(self.volume.lock().effective());

        let strategy: Arc<dyn PlaybackStrategy> = match self.config.mode {
            PlaybackMode::Delegated => {
                match DelegatedStrategy::start(graph.clone(), self.events.clone(), &self.config) {
                    Ok(strategy) => Arc::new(strategy),
                    Err(e) => {
                        if owns_graph {
                            let _ = graph.close();
                        }
                        return Err(e);
                    }
                }
            }
            PlaybackMode::Direct => Arc::new(DirectStrategy::new(graph.clone(), self.events.clone())),
        };

        let bytes = vec![0u8; graph.frequency_bin_count()];
        let sampler = Arc::new(Mutex::new(Sampler {
            graph: graph.clone(),
            strategy: strategy.clone(),
            store: self.store.clone(),
            bytes,
            bands: [0.0; BAND_COUNT],
            was_playing: false,
        }));
        let sampler_task = Self::spawn_sampler(sampler.clone(), self.frame_interval);

        info!(
            mode = ?self.config.mode,
            sample_rate = graph.sample_rate(),
            shared = !owns_graph,
            "Playback scheduler initialized"
        );

        *self.engine.lock() = Some(Engine {
            graph,
            owns_graph,
            strategy,
            sampler,
            sampler_task,
        });
        Ok(())
    }

    fn spawn_sampler(sampler: Arc<Mutex<Sampler>>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sampler.lock().sample();
            }
        })
    }

    /// Append a released fragment to the playback queue.
    pub fn enqueue(&self, fragment: AudioFragment) -> Result<(), AudioError> {
        let strategy = self.strategy().ok_or(AudioError::NotInitialized)?;
        strategy.enqueue(fragment)
    }

    /// Halt playback, discard the queue and publish silence.
    pub fn stop(&self) {
        if let Some(strategy) = self.strategy() {
            strategy.stop();
        }
        self.store.clear();
    }

    /// Shut playback down and close the graph if this scheduler owns it.
    ///
    /// Closing is retried `close_attempts` times; the last failure is
    /// returned as `AudioError::ClosureFailure`.
    pub async fn stop_and_teardown(&self) -> Result<(), AudioError> {
        let engine = self.engine.lock().take();
        let Some(engine) = engine else {
            return Ok(());
        };

        engine.sampler_task.abort();
        engine.strategy.finish().await;
        self.store.clear();

        if !engine.owns_graph {
            debug!("Leaving shared audio graph open");
            return Ok(());
        }

        close_graph(
            engine.graph.as_ref(),
            self.config.close_attempts,
            self.config.close_retry_delay(),
        )
        .await
    }

    /// Sample rate of the graph fragments must be decoded to.
    pub fn sample_rate(&self) -> Option<u32> {
        self.engine.lock().as_ref().map(|e| e.graph.sample_rate())
    }

    /// Set the stored output volume, clamped to 0.0..=1.0.
    ///
    /// While muted the level is remembered and applied on `unmute()`.
    pub fn set_volume(&self, level: f32) {
        let effective = {
            let mut volume = self.volume.lock();
            volume.volume = level.clamp(0.0, 1.0);
            volume.effective()
        };
        self.apply_gain(effective);
    }

    pub fn volume(&self) -> f32 {
        self.volume.lock().volume
    }

    pub fn mute(&self) {
        self.volume.lock().muted = true;
        self.apply_gain(0.0);
    }

    pub fn unmute(&self) {
        let effective = {
            let mut volume = self.volume.lock();
            volume.muted = false;
            volume.effective()
        };
        self.apply_gain(effective);
    }

    pub fn is_muted(&self) -> bool {
        self.volume.lock().muted
    }

    pub fn queue_length(&self) -> usize {
        self.strategy().map(|s| s.queue_length()).unwrap_or(0)
    }

    pub fn is_playing(&self) -> bool {
        self.strategy().map(|s| s.is_playing()).unwrap_or(false)
    }

    /// Sample the output spectrum into the store once, outside the timer.
    pub fn sample_visualization(&self) {
        let sampler = self.engine.lock().as_ref().map(|e| e.sampler.clone());
        if let Some(sampler) = sampler {
            sampler.lock().sample();
        }
    }

    pub fn visualization(&self) -> &VisualizationStore {
        &self.store
    }

    fn strategy(&self) -> Option<Arc<dyn PlaybackStrategy>> {
        self.engine.lock().as_ref().map(|e| e.strategy.clone())
    }

    fn apply_gain(&self, gain: f32) {
        if let Some(engine) = self.engine.lock().as_ref() {
            engine.graph.set_gain(gain);
        }
    }
}

/// Close `graph`, retrying up to `attempts` times with `retry_delay` between
/// attempts. The last failure is returned as `AudioError::ClosureFailure`.
pub async fn close_graph(
    graph: &dyn AudioGraph,
    attempts: u32,
    retry_delay: Duration,
) -> Result<(), AudioError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match graph.close() {
            Ok(()) => {
                info!(attempt, "Audio graph closed");
                return Ok(());
            }
            Err(e) if attempt >= attempts => {
                error!(attempts, error = %e, "Giving up closing audio graph");
                return Err(AudioError::ClosureFailure(format!(
                    "failed after {} attempts: {}",
                    attempts, e
                )));
            }
            Err(e) => {
                warn!(attempt, error = %e, "Audio graph close failed, retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.get_mut().take() {
            engine.sampler_task.abort();
            engine.strategy.stop();
            if engine.owns_graph {
                let _ = engine.graph.close();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::graph::{EndedCallback, SourceNode, WorkletPort};
    use crate::audio::software::SoftwareGraph;
    use crate::audio::visualization::ManualFrameScheduler;
    use crate::config::ClientConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Graph whose `close()` fails a fixed number of times.
    pub(crate) struct FlakyGraph {
        inner: SoftwareGraph,
        failures_left: AtomicU32,
        pub(crate) close_calls: AtomicU32,
    }

    impl FlakyGraph {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                inner: SoftwareGraph::headless(1_000),
                failures_left: AtomicU32::new(failures),
                close_calls: AtomicU32::new(0),
            }
        }
    }

    impl AudioGraph for FlakyGraph {
        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }
        fn set_output_device(&self, device_id: &str) -> Result<(), AudioError> {
            self.inner.set_output_device(device_id)
        }
        fn set_gain(&self, gain: f32) {
            self.inner.set_gain(gain)
        }
        fn gain(&self) -> f32 {
            self.inner.gain()
        }
        fn start_source(
            &self,
            samples: Arc<[f32]>,
            on_ended: EndedCallback,
        ) -> Result<Box<dyn SourceNode>, AudioError> {
            self.inner.start_source(samples, on_ended)
        }
        fn load_worklet(&self) -> Result<WorkletPort, AudioError> {
            self.inner.load_worklet()
        }
        fn frequency_bin_count(&self) -> usize {
            self.inner.frequency_bin_count()
        }
        fn byte_frequency_data(&self, out: &mut [u8]) {
            self.inner.byte_frequency_data(out)
        }
        fn close(&self) -> Result<(), AudioError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AudioError::ClosureFailure("device busy".to_string()));
            }
            self.inner.close()
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    /// Host handing out one prepared graph.
    pub(crate) struct FixedHost(pub(crate) Arc<dyn AudioGraph>);

    impl AudioHost for FixedHost {
        fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, AudioError> {
            Ok(self.0.clone())
        }
    }

    struct FailingHost;

    impl AudioHost for FailingHost {
        fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, AudioError> {
            Err(AudioError::InitializationFailure("no output".to_string()))
        }
    }

    fn scheduler(mode: PlaybackMode) -> (PlaybackScheduler, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let mut config = ClientConfig::default().playback;
        config.mode = mode;
        config.close_retry_delay_ms = 10;
        config.close_confirm_interval_ms = 5;
        let store = VisualizationStore::new(Arc::new(ManualFrameScheduler::new()));
        PlaybackScheduler::new(config, store, Duration::from_millis(16))
    }

    #[tokio::test]
    async fn test_enqueue_before_initialize_fails() {
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        let fragment = AudioFragment::new("utt", 0, vec![0.1; 4], 1_000);
        assert_eq!(scheduler.enqueue(fragment), Err(AudioError::NotInitialized));
        assert!(scheduler.stop_and_teardown().await.is_ok());
    }

    #[tokio::test]
    async fn test_graph_creation_failure() {
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        let result = scheduler.initialize(&FailingHost, None);
        assert!(matches!(result, Err(AudioError::InitializationFailure(_))));
        assert!(!scheduler.is_initialized());
    }

    #[tokio::test]
    async fn test_missing_worklet_fails_delegated_init() {
        let graph: Arc<dyn AudioGraph> = Arc::new(SoftwareGraph::headless(1_000).without_worklet());
        let (scheduler, _events) = scheduler(PlaybackMode::Delegated);
        let result = scheduler.initialize(&FixedHost(graph.clone()), None);
        assert!(matches!(result, Err(AudioError::WorkletUnavailable(_))));
        assert!(graph.is_closed());
    }

    #[tokio::test]
    async fn test_device_bind_failure_is_ignored() {
        let graph: Arc<dyn AudioGraph> =
            Arc::new(SoftwareGraph::headless(1_000).with_devices(vec!["speakers".to_string()]));
        let (mut scheduler, _events) = scheduler(PlaybackMode::Direct);
        scheduler.config.output_device_id = Some("missing".to_string());
        assert!(scheduler.initialize(&FixedHost(graph), None).is_ok());
        scheduler.stop_and_teardown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_retried_then_reported() {
        let graph = Arc::new(FlakyGraph::new(10));
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        scheduler.initialize(&FixedHost(graph.clone()), None).unwrap();

        let result = scheduler.stop_and_teardown().await;
        assert!(matches!(result, Err(AudioError::ClosureFailure(_))));
        assert_eq!(graph.close_calls.load(Ordering::SeqCst), 5);
        assert!(!scheduler.is_initialized());
        let _ = graph.inner.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_succeeds_after_transient_failures() {
        let graph = Arc::new(FlakyGraph::new(2));
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        scheduler.initialize(&FixedHost(graph.clone()), None).unwrap();

        assert!(scheduler.stop_and_teardown().await.is_ok());
        assert_eq!(graph.close_calls.load(Ordering::SeqCst), 3);
        assert!(graph.is_closed());
    }

    #[tokio::test]
    async fn test_shared_graph_is_not_closed() {
        let graph: Arc<dyn AudioGraph> = Arc::new(SoftwareGraph::headless(1_000));
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        scheduler
            .initialize(&FailingHost, Some(graph.clone()))
            .unwrap();
        scheduler.stop_and_teardown().await.unwrap();
        assert!(!graph.is_closed());
        graph.close().unwrap();
    }

    #[tokio::test]
    async fn test_volume_and_mute() {
        let graph: Arc<dyn AudioGraph> = Arc::new(SoftwareGraph::headless(1_000));
        let (scheduler, _events) = scheduler(PlaybackMode::Direct);
        scheduler.initialize(&FixedHost(graph.clone()), None).unwrap();

        scheduler.set_volume(1.7);
        assert_eq!(graph.gain(), 1.0);
        scheduler.set_volume(0.4);
        scheduler.mute();
        assert_eq!(graph.gain(), 0.0);
        assert_eq!(scheduler.volume(), 0.4);

        scheduler.set_volume(0.6);
        assert_eq!(graph.gain(), 0.0);
        scheduler.unmute();
        assert_eq!(graph.gain(), 0.6);
        scheduler.stop_and_teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_clears_visualization_synchronously() {
        let frames = Arc::new(ManualFrameScheduler::new());
        let store = VisualizationStore::new(frames.clone());
        let (scheduler, _events) = PlaybackScheduler::new(
            ClientConfig::default().playback,
            store.clone(),
            Duration::from_millis(16),
        );
        store.write(&[1.0; BAND_COUNT]);
        frames.advance_frame();
        assert_eq!(store.snapshot()[0], 1.0);

        scheduler.stop();
        assert!(store.snapshot().iter().all(|&v| v == 0.0));
    }

    #[tokio::test]
    async fn test_sampling_publishes_while_playing() {
        let graph = Arc::new(SoftwareGraph::headless(8_000));
        let frames = Arc::new(ManualFrameScheduler::new());
        let store = VisualizationStore::new(frames.clone());
        let mut config = ClientConfig::default().playback;
        config.mode = PlaybackMode::Direct;
        let (scheduler, _events) =
            PlaybackScheduler::new(config, store.clone(), Duration::from_secs(3600));
        let shared: Arc<dyn AudioGraph> = graph.clone();
        scheduler.initialize(&FailingHost, Some(shared)).unwrap();

        let tone: Vec<f32> = (0..8_000)
            .map(|n| (2.0 * std::f32::consts::PI * 1_000.0 * n as f32 / 8_000.0).sin())
            .collect();
        scheduler
            .enqueue(AudioFragment::new("utt", 0, tone, 8_000))
            .unwrap();
        graph.render_quantum(4_096);

        scheduler.sample_visualization();
        frames.advance_frame();
        assert!(store.snapshot().iter().any(|&v| v > 0.0));

        scheduler.stop();
        assert!(store.snapshot().iter().all(|&v| v == 0.0));
        scheduler.stop_and_teardown().await.unwrap();
        graph.close().unwrap();
    }
}
