//! # Microphone
//!
//! Capture is behind the `Microphone` trait so sessions can run against a
//! real device, a file, or a test feed.
//!
//! ## Lifecycle:
//! 1. `acquire()` obtains a stream description (permission and device checks)
//! 2. `start()` begins delivering mono float chunks to a callback
//! 3. `mute()`/`unmute()` replace delivered audio with silence
//! 4. `stop()` ends delivery; the microphone can be started again later
//!
//! `ChannelMicrophone` is fed through an `mpsc` channel by whatever produces
//! the audio (a WAV reader in the binary, test code in tests).

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::MicError;

/// Receives each captured chunk of mono samples.
pub type AudioCallback = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// An acquired capture stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MicStream {
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

pub trait Microphone: Send + Sync {
    /// Obtain a capture stream from `device_id` (or the default device).
    fn acquire(&self, device_id: Option<String>) -> BoxFuture<'static, Result<MicStream, MicError>>;

    /// Start delivering audio from `stream` to `on_audio`.
    fn start(&self, stream: &MicStream, on_audio: AudioCallback) -> Result<(), MicError>;

    /// Stop delivering audio. Stopping an idle microphone is a no-op.
    fn stop(&self) -> BoxFuture<'static, Result<(), MicError>>;

    fn mute(&self);

    fn unmute(&self);

    fn is_muted(&self) -> bool;
}

struct Capture {
    cancel: CancellationToken,
    task: JoinHandle<mpsc::Receiver<Vec<f32>>>,
}

struct ChannelInner {
    sample_rate: u32,
    channels: u16,
    devices: Option<Vec<String>>,
    permission_granted: bool,
    feed: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    capture: Mutex<Option<Capture>>,
    muted: AtomicBool,
}

/// Microphone fed through a channel of interleaved float chunks.
#[derive(Clone)]
pub struct ChannelMicrophone {
    inner: Arc<ChannelInner>,
}

impl ChannelMicrophone {
    /// Create a microphone and the sender that feeds it.
    pub fn new(sample_rate: u32, channels: u16) -> (Self, mpsc::Sender<Vec<f32>>) {
        Self::build(sample_rate, channels, None, true)
    }

    /// Microphone that only knows the given device ids.
    pub fn with_devices(
        sample_rate: u32,
        channels: u16,
        devices: Vec<String>,
    ) -> (Self, mpsc::Sender<Vec<f32>>) {
        Self::build(sample_rate, channels, Some(devices), true)
    }

    /// Microphone whose permission prompt is always refused.
    pub fn denied(sample_rate: u32) -> Self {
        Self::build(sample_rate, 1, None, false).0
    }

    fn build(
        sample_rate: u32,
        channels: u16,
        devices: Option<Vec<String>>,
        permission_granted: bool,
    ) -> (Self, mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = mpsc::channel(64);
        let microphone = Self {
            inner: Arc::new(ChannelInner {
                sample_rate,
                channels: channels.max(1),
                devices,
                permission_granted,
                feed: Mutex::new(Some(rx)),
                capture: Mutex::new(None),
                muted: AtomicBool::new(false),
            }),
        };
        (microphone, tx)
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capture.lock().is_some()
    }
}

impl Microphone for ChannelMicrophone {
    fn acquire(&self, device_id: Option<String>) -> BoxFuture<'static, Result<MicStream, MicError>> {
        let inner = self.inner.clone();
        async move {
            if !inner.permission_granted {
                return Err(MicError::PermissionDenied(
                    "microphone access was refused".to_string(),
                ));
            }
            if let (Some(devices), Some(device)) = (&inner.devices, &device_id) {
                if !devices.contains(device) {
                    return Err(MicError::InitializationFailure(format!(
                        "unknown input device '{}'",
                        device
                    )));
                }
            }
            Ok(MicStream {
                device_id,
                sample_rate: inner.sample_rate,
                channels: inner.channels,
            })
        }
        .boxed()
    }

    fn start(&self, stream: &MicStream, on_audio: AudioCallback) -> Result<(), MicError> {
        let mut capture = self.inner.capture.lock();
        if capture.is_some() {
            return Ok(());
        }
        let mut feed = self.inner.feed.lock().take().ok_or_else(|| {
            MicError::InitializationFailure("capture feed is unavailable".to_string())
        })?;

        let channels = stream.channels.max(1) as usize;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();

        let task = tokio::spawn(async move {
            let mut mono = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = feed.recv() => chunk,
                };
                let Some(chunk) = chunk else { break };

                mono.clear();
                if channels == 1 {
                    mono.extend_from_slice(&chunk);
                } else {
                    mono.extend(
                        chunk
                            .chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                }
                if inner.muted.load(Ordering::SeqCst) {
                    mono.fill(0.0);
                }
                on_audio(&mono);
            }
            feed
        });

        info!(
            device_id = ?stream.device_id,
            sample_rate = stream.sample_rate,
            "Microphone capture started"
        );
        *capture = Some(Capture { cancel, task });
        Ok(())
    }

    fn stop(&self) -> BoxFuture<'static, Result<(), MicError>> {
        let capture = self.inner.capture.lock().take();
        let inner = self.inner.clone();
        async move {
            let Some(capture) = capture else {
                return Ok(());
            };
            capture.cancel.cancel();
            let feed = capture
                .task
                .await
                .map_err(|e| MicError::ClosureFailure(format!("capture task failed: {}", e)))?;
            *inner.feed.lock() = Some(feed);
            debug!("Microphone capture stopped");
            Ok(())
        }
        .boxed()
    }

    fn mute(&self) {
        self.inner.muted.store(true, Ordering::SeqCst);
    }

    fn unmute(&self) {
        self.inner.muted.store(false, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }
}
