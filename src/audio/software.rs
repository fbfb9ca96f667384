//! # Software Audio Graph
//!
//! A portable `AudioGraph` that mixes in fixed render quanta on a tokio
//! render clock and hands the result to an `OutputSink`.
//!
//! ## Render quantum:
//! 1. Mix active buffer sources up to the next frame where one of them ends
//! 2. Release the graph lock and run the completion callbacks; sources they
//!    start are mixed from that frame on, so chained buffers stay gapless
//! 3. Repeat until the quantum is full
//! 4. Let the rendering unit (if loaded) add its output
//! 5. Apply the gain stage, feed the spectrum analyser, write to the sink
//!
//! ## Sinks:
//! - **NullSink**: discards output (headless sessions, tests)
//! - **WavRecorder**: records output to a 16-bit WAV file written on close

use parking_lot::Mutex;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::graph::{
    AudioGraph, AudioHost, EndedCallback, SourceNode, WorkletPort,
};
use crate::audio::worklet::WorkletProcessor;
use crate::config::VisualizationConfig;
use crate::error::AudioError;

/// Destination of rendered audio.
pub trait OutputSink: Send {
    fn write(&mut self, frames: &[f32]);

    /// Flush and release the sink. Called when the graph closes.
    fn finish(&mut self) -> Result<(), AudioError>;
}

/// Sink that discards everything.
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _frames: &[f32]) {}

    fn finish(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Records rendered mono output as a 16-bit PCM WAV file.
pub struct WavRecorder<W = File> {
    name: String,
    sample_rate: u32,
    file: Option<W>,
    samples: Vec<i16>,
}

impl WavRecorder<File> {
    /// Create the output file up front so a bad path fails graph creation.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            AudioError::InitializationFailure(format!(
                "cannot create recording {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::from_writer(file, path.display().to_string(), sample_rate))
    }
}

impl<W: Write + Seek + Send> WavRecorder<W> {
    pub fn from_writer(writer: W, name: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            name: name.into(),
            sample_rate,
            file: Some(writer),
            samples: Vec::new(),
        }
    }
}

impl<W: Write + Seek + Send> OutputSink for WavRecorder<W> {
    fn write(&mut self, frames: &[f32]) {
        self.samples.extend(
            frames
                .iter()
                .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16),
        );
    }

    /// Write the file. On failure the samples and the file are kept, so a
    /// retried close writes the whole recording again from the start.
    fn finish(&mut self) -> Result<(), AudioError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let data = wav::BitDepth::Sixteen(self.samples.clone());
        file.seek(SeekFrom::Start(0))
            .and_then(|_| wav::write(header, &data, file))
            .map_err(|e| {
                AudioError::ClosureFailure(format!(
                    "cannot write recording {}: {}",
                    self.name, e
                ))
            })?;

        self.file = None;
        self.samples = Vec::new();
        info!(recording = %self.name, "Playback recording written");
        Ok(())
    }
}

struct ActiveSource {
    id: u64,
    samples: Arc<[f32]>,
    position: usize,
    on_ended: Option<EndedCallback>,
}

struct GraphInner {
    gain: f32,
    output_device: Option<String>,
    sources: Vec<ActiveSource>,
    worklet: Option<WorkletProcessor>,
    analyser: SpectrumAnalyser,
    mix: Vec<f32>,
    sink: Box<dyn OutputSink>,
    next_source_id: u64,
    frames_rendered: u64,
}

/// Software-rendered audio graph.
pub struct SoftwareGraph {
    sample_rate: u32,
    known_devices: Option<Vec<String>>,
    worklet_support: bool,
    inner: Arc<Mutex<GraphInner>>,
    /// Held for a whole quantum; the graph lock is released between segments.
    render_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SoftwareGraph {
    pub fn new(sample_rate: u32, analyser: SpectrumAnalyser, sink: Box<dyn OutputSink>) -> Self {
        Self {
            sample_rate,
            known_devices: None,
            worklet_support: true,
            inner: Arc::new(Mutex::new(GraphInner {
                gain: 1.0,
                output_device: None,
                sources: Vec::new(),
                worklet: None,
                analyser,
                mix: Vec::new(),
                sink,
                next_source_id: 0,
                frames_rendered: 0,
            })),
            render_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Headless graph with a default analyser and a `NullSink`.
    pub fn headless(sample_rate: u32) -> Self {
        Self::new(
            sample_rate,
            SpectrumAnalyser::new(2048, 0.8, -100.0, -30.0),
            Box::new(NullSink),
        )
    }

    /// Restrict `set_output_device` to these device ids.
    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.known_devices = Some(devices);
        self
    }

    pub fn without_worklet(mut self) -> Self {
        self.worklet_support = false;
        self
    }

    pub fn output_device(&self) -> Option<String> {
        self.inner.lock().output_device.clone()
    }

    pub fn active_sources(&self) -> usize {
        self.inner.lock().sources.len()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.inner.lock().frames_rendered
    }

    /// Render `frames` samples of output, running completion callbacks at
    /// the frame where their source ends.
    pub fn render_quantum(&self, frames: usize) {
        let _rendering = self.render_lock.lock();
        if self.is_closed() {
            return;
        }

        self.inner.lock().begin_quantum(frames);
        let mut offset = 0;
        loop {
            let (end, finished) = self.inner.lock().mix_segment(offset);
            offset = end;
            if finished.is_empty() {
                break;
            }
            for on_ended in finished {
                on_ended();
            }
        }

        let mut inner = self.inner.lock();
        // `close` flips the flag under this lock
        if !self.is_closed() {
            inner.finish_quantum();
        }
    }

    /// Drive `render_quantum` from a tokio interval until the graph closes.
    pub fn spawn_render_clock(self: &Arc<Self>, quantum: Duration) -> Result<(), AudioError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            AudioError::InitializationFailure(format!("no async runtime for render clock: {}", e))
        })?;
        let frames = ((self.sample_rate as f64 * quantum.as_secs_f64()).round() as usize).max(1);
        let graph: Weak<Self> = Arc::downgrade(self);

        handle.spawn(async move {
            let mut clock = tokio::time::interval(quantum);
            clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
            loop {
                clock.tick().await;
                let Some(graph) = graph.upgrade() else { break };
                if graph.is_closed() {
                    break;
                }
                graph.render_quantum(frames);
            }
            debug!("Render clock stopped");
        });
        Ok(())
    }
}

impl GraphInner {
    fn begin_quantum(&mut self, frames: usize) {
        self.mix.clear();
        self.mix.resize(frames, 0.0);
    }

    /// Mix every source from `offset` up to the earliest frame at which one
    /// of them ends (or the end of the quantum). Returns that frame and the
    /// callbacks of the sources that ended there.
    fn mix_segment(&mut self, offset: usize) -> (usize, Vec<EndedCallback>) {
        let frames = self.mix.len();
        let end = self
            .sources
            .iter()
            .map(|source| offset + source.samples.len().saturating_sub(source.position))
            .fold(frames, usize::min);

        let mut finished = Vec::new();
        let segment = &mut self.mix[offset..end];
        self.sources.retain_mut(|source| {
            let start = source.position.min(source.samples.len());
            let count = segment.len().min(source.samples.len() - start);
            for (out, sample) in segment.iter_mut().zip(&source.samples[start..start + count]) {
                *out += sample;
            }
            source.position += count;
            if source.position >= source.samples.len() {
                if let Some(on_ended) = source.on_ended.take() {
                    finished.push(on_ended);
                }
                false
            } else {
                true
            }
        });

        (end, finished)
    }

    fn finish_quantum(&mut self) {
        if let Some(worklet) = self.worklet.as_mut() {
            if !worklet.process(&mut self.mix) {
                self.worklet = None;
            }
        }

        let gain = self.gain;
        for sample in self.mix.iter_mut() {
            *sample *= gain;
        }
        self.analyser.push_samples(&self.mix);
        self.sink.write(&self.mix);
        self.frames_rendered += self.mix.len() as u64;
    }
}

struct SoftwareSource {
    id: u64,
    graph: Weak<Mutex<GraphInner>>,
}

impl SourceNode for SoftwareSource {
    fn disconnect(&mut self) {
        if let Some(inner) = self.graph.upgrade() {
            inner.lock().sources.retain(|source| source.id != self.id);
        }
    }
}

impl AudioGraph for SoftwareGraph {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_output_device(&self, device_id: &str) -> Result<(), AudioError> {
        if let Some(devices) = &self.known_devices {
            if !devices.iter().any(|d| d == device_id) {
                return Err(AudioError::InitializationFailure(format!(
                    "unknown output device '{}'",
                    device_id
                )));
            }
        }
        self.inner.lock().output_device = Some(device_id.to_string());
        Ok(())
    }

    fn set_gain(&self, gain: f32) {
        self.inner.lock().gain = gain.clamp(0.0, 1.0);
    }

    fn gain(&self) -> f32 {
        self.inner.lock().gain
    }

    fn start_source(
        &self,
        samples: Arc<[f32]>,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn SourceNode>, AudioError> {
        if self.is_closed() {
            return Err(AudioError::InitializationFailure(
                "audio graph is closed".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let id = inner.next_source_id;
        inner.next_source_id += 1;
        inner.sources.push(ActiveSource {
            id,
            samples,
            position: 0,
            on_ended: Some(on_ended),
        });
        Ok(Box::new(SoftwareSource {
            id,
            graph: Arc::downgrade(&self.inner),
        }))
    }

    fn load_worklet(&self) -> Result<WorkletPort, AudioError> {
        if !self.worklet_support {
            return Err(AudioError::WorkletUnavailable(
                "graph has no realtime rendering support".to_string(),
            ));
        }
        if self.is_closed() {
            return Err(AudioError::WorkletUnavailable(
                "audio graph is closed".to_string(),
            ));
        }
        let (processor, port) = WorkletProcessor::new(self.sample_rate);
        self.inner.lock().worklet = Some(processor);
        Ok(port)
    }

    fn frequency_bin_count(&self) -> usize {
        self.inner.lock().analyser.frequency_bin_count()
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        self.inner.lock().analyser.byte_frequency_data(out);
    }

    fn close(&self) -> Result<(), AudioError> {
        if self.is_closed() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.sink.finish()?;
        // Dropping sources discards their callbacks
        inner.sources.clear();
        inner.worklet = None;
        self.closed.store(true, Ordering::SeqCst);
        debug!(frames = inner.frames_rendered, "Audio graph closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// `AudioHost` producing `SoftwareGraph`s driven by a render clock.
#[derive(Debug, Clone)]
pub struct SoftwareHost {
    sample_rate: u32,
    quantum: Duration,
    visualization: VisualizationConfig,
    devices: Option<Vec<String>>,
    record_path: Option<PathBuf>,
    worklet_support: bool,
}

impl SoftwareHost {
    pub fn new(sample_rate: u32, visualization: VisualizationConfig) -> Self {
        Self {
            sample_rate,
            quantum: Duration::from_millis(10),
            visualization,
            devices: None,
            record_path: None,
            worklet_support: true,
        }
    }

    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Record everything the graphs render into a WAV file.
    pub fn with_recording(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = Some(path.into());
        self
    }

    pub fn without_worklet(mut self) -> Self {
        self.worklet_support = false;
        self
    }
}

impl AudioHost for SoftwareHost {
    fn create_graph(&self) -> Result<Arc<dyn AudioGraph>, AudioError> {
        let sink: Box<dyn OutputSink> = match &self.record_path {
            Some(path) => Box::new(WavRecorder::create(path, self.sample_rate)?),
            None => Box::new(NullSink),
        };

        let mut graph = SoftwareGraph::new(
            self.sample_rate,
            SpectrumAnalyser::from_config(&self.visualization),
            sink,
        );
        if let Some(devices) = &self.devices {
            graph = graph.with_devices(devices.clone());
        }
        if !self.worklet_support {
            graph = graph.without_worklet();
        }

        let graph = Arc::new(graph);
        graph.spawn_render_clock(self.quantum)?;
        info!(sample_rate = self.sample_rate, "Software audio graph created");
        Ok(graph)
    }
}

impl Drop for SoftwareGraph {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Audio graph dropped without being closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::graph::{WorkletCommand, WorkletEvent};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    /// Sink that keeps everything rendered.
    pub(crate) struct CaptureSink(pub(crate) Arc<Mutex<Vec<f32>>>);

    impl OutputSink for CaptureSink {
        fn write(&mut self, frames: &[f32]) {
            self.0.lock().extend_from_slice(frames);
        }

        fn finish(&mut self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    pub(crate) fn capturing_graph(sample_rate: u32) -> (Arc<SoftwareGraph>, Arc<Mutex<Vec<f32>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let graph = SoftwareGraph::new(
            sample_rate,
            SpectrumAnalyser::new(256, 0.0, -100.0, -30.0),
            Box::new(CaptureSink(output.clone())),
        );
        (Arc::new(graph), output)
    }

    /// In-memory writer whose first `failures` writes error out.
    struct FlakyWriter {
        failures: u32,
        data: Arc<Mutex<Cursor<Vec<u8>>>>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.data.lock().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyWriter {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.data.lock().seek(pos)
        }
    }

    fn counter() -> (Arc<AtomicUsize>, EndedCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let callback: EndedCallback = Box::new(move || {
            handle.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_source_completion_fires_once() {
        let graph = SoftwareGraph::headless(1_000);
        let (ended, callback) = counter();
        graph.start_source(vec![0.5; 15].into(), callback).unwrap();

        graph.render_quantum(10);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        graph.render_quantum(10);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        graph.render_quantum(10);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(graph.active_sources(), 0);
        graph.close().unwrap();
    }

    #[test]
    fn test_chained_source_starts_mid_quantum() {
        let (graph, output) = capturing_graph(1_000);
        let chained = graph.clone();
        let (ended, callback) = counter();
        graph
            .start_source(
                vec![1.0; 15].into(),
                Box::new(move || {
                    chained.start_source(vec![1.0; 15].into(), callback).unwrap();
                }),
            )
            .unwrap();

        for _ in 0..4 {
            graph.render_quantum(10);
        }

        assert_eq!(ended.load(Ordering::SeqCst), 1);
        let rendered = output.lock().clone();
        assert_eq!(rendered.len(), 40);
        assert!(rendered[..30].iter().all(|&s| s == 1.0), "gap in {:?}", rendered);
        assert!(rendered[30..].iter().all(|&s| s == 0.0));
        graph.close().unwrap();
    }

    #[test]
    fn test_disconnected_source_never_calls_back() {
        let graph = SoftwareGraph::headless(1_000);
        let (ended, callback) = counter();
        let mut source = graph.start_source(vec![0.5; 5].into(), callback).unwrap();
        source.disconnect();
        graph.render_quantum(10);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        graph.close().unwrap();
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let graph = SoftwareGraph::headless(48_000).with_devices(vec!["speakers".to_string()]);
        assert!(graph.set_output_device("speakers").is_ok());
        assert!(matches!(
            graph.set_output_device("headphones"),
            Err(AudioError::InitializationFailure(_))
        ));
        assert_eq!(graph.output_device().as_deref(), Some("speakers"));
        graph.close().unwrap();
    }

    #[test]
    fn test_worklet_output_is_mixed() {
        let graph = SoftwareGraph::headless(1_000);
        let mut port = graph.load_worklet().unwrap();
        port.commands
            .send(WorkletCommand::Enqueue {
                utterance_id: "utt".to_string(),
                fragment_index: 0,
                samples: vec![0.5; 4].into(),
            })
            .unwrap();
        graph.render_quantum(8);

        let mut saw_end = false;
        while let Ok(event) = port.events.try_recv() {
            saw_end |= event == WorkletEvent::Ended;
        }
        assert!(saw_end);
        graph.close().unwrap();
    }

    #[test]
    fn test_worklet_unavailable() {
        let graph = SoftwareGraph::headless(1_000).without_worklet();
        assert!(matches!(
            graph.load_worklet(),
            Err(AudioError::WorkletUnavailable(_))
        ));
        graph.close().unwrap();
    }

    #[test]
    fn test_closed_graph_stops_rendering() {
        let graph = SoftwareGraph::headless(1_000);
        graph.render_quantum(10);
        graph.close().unwrap();
        assert!(graph.is_closed());
        graph.render_quantum(10);
        assert_eq!(graph.frames_rendered(), 10);
        assert!(graph.start_source(vec![0.1].into(), Box::new(|| {})).is_err());
        assert!(graph.close().is_ok());
    }

    #[test]
    fn test_wav_recorder_writes_file() {
        let path = std::env::temp_dir().join(format!("voice-client-{}.wav", uuid::Uuid::new_v4()));
        let recorder = WavRecorder::create(&path, 8_000).unwrap();
        let graph = SoftwareGraph::new(
            8_000,
            SpectrumAnalyser::new(256, 0.0, -100.0, -30.0),
            Box::new(recorder),
        );
        graph.start_source(vec![0.25; 80].into(), Box::new(|| {})).unwrap();
        graph.render_quantum(80);
        graph.close().unwrap();

        let mut file = File::open(&path).unwrap();
        let (header, data) = wav::read(&mut file).unwrap();
        assert_eq!(header.sampling_rate, 8_000);
        match data {
            wav::BitDepth::Sixteen(samples) => {
                assert_eq!(samples.len(), 80);
                assert_eq!(samples[0], 8192);
            }
            _ => panic!("expected 16-bit samples"),
        }
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_failed_recording_write_is_retried() {
        let data = Arc::new(Mutex::new(Cursor::new(Vec::new())));
        let writer = FlakyWriter {
            failures: 1,
            data: data.clone(),
        };
        let graph = SoftwareGraph::new(
            8_000,
            SpectrumAnalyser::new(256, 0.0, -100.0, -30.0),
            Box::new(WavRecorder::from_writer(writer, "memory", 8_000)),
        );
        graph.start_source(vec![0.25; 40].into(), Box::new(|| {})).unwrap();
        graph.render_quantum(40);

        assert!(matches!(graph.close(), Err(AudioError::ClosureFailure(_))));
        assert!(!graph.is_closed());
        graph.close().unwrap();

        let mut written = Cursor::new(data.lock().get_ref().clone());
        let (header, samples) = wav::read(&mut written).unwrap();
        assert_eq!(header.sampling_rate, 8_000);
        match samples {
            wav::BitDepth::Sixteen(samples) => assert_eq!(samples, vec![8192; 40]),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_render_clock_drives_sources() {
        let host = SoftwareHost::new(1_000, VisualizationConfig {
            frame_rate_hz: 60,
            fft_size: 256,
            smoothing: 0.5,
            min_decibels: -100.0,
            max_decibels: -30.0,
        });
        let graph = host.create_graph().unwrap();
        let (ended, callback) = counter();
        graph.start_source(vec![0.1; 50].into(), callback).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        graph.close().unwrap();
    }
}
