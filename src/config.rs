//! # Configuration Management
//!
//! Loads the client configuration from multiple sources in priority order:
//! built-in defaults, an optional `voice-client.toml`, then environment
//! variables prefixed with `VOICE__` (double underscore separates sections,
//! e.g. `VOICE__PLAYBACK__MODE=direct`).
//!
//! ## Sections:
//! - **transport**: where and how to reach the voice server
//! - **playback**: playback strategy, output device and teardown timing
//! - **microphone**: capture device and optional WAV input
//! - **visualization**: display rate and spectrum analyser parameters
//! - **session**: history retention and reorder-buffer limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
    pub microphone: MicrophoneConfig,
    pub visualization: VisualizationConfig,
    pub session: SessionConfig,
}

/// Voice server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint of the voice server
    pub url: String,
    /// Bearer token sent with the upgrade request
    pub api_key: Option<String>,
    /// Server-side configuration profile to start the chat with
    pub config_id: Option<String>,
}

/// Which playback strategy a session uses. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Fragments are relayed to a realtime rendering unit over a message channel
    Delegated,
    /// The scheduler chains buffer sources itself on completion callbacks
    Direct,
}

/// Playback engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub mode: PlaybackMode,
    /// Output device to bind; binding failures fall back to the default device
    pub output_device_id: Option<String>,
    /// Sample rate of the audio graph (fragments are converted to it)
    pub sample_rate: u32,
    /// Rate assumed for headerless PCM16 fragments from the server
    pub source_sample_rate: u32,
    /// Initial output volume (0.0..=1.0)
    pub volume: f32,
    /// Share one audio graph between capture and playback
    pub share_audio_clock: bool,
    /// Fade applied by the rendering unit before it ends (delegated mode)
    pub fade_out_ms: u64,
    /// How many times teardown polls for the rendering unit's close confirmation
    pub close_confirm_attempts: u32,
    pub close_confirm_interval_ms: u64,
    /// How many times teardown tries to close the audio graph
    pub close_attempts: u32,
    pub close_retry_delay_ms: u64,
    /// Optional WAV file the software renderer records playback into
    pub record_path: Option<String>,
}

impl PlaybackConfig {
    pub fn fade_out(&self) -> Duration {
        Duration::from_millis(self.fade_out_ms)
    }

    pub fn close_confirm_interval(&self) -> Duration {
        Duration::from_millis(self.close_confirm_interval_ms)
    }

    pub fn close_retry_delay(&self) -> Duration {
        Duration::from_millis(self.close_retry_delay_ms)
    }
}

/// Microphone settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrophoneConfig {
    pub device_id: Option<String>,
    /// Capture sample rate sent to the server
    pub sample_rate: u32,
    /// WAV file streamed in real time as the microphone (used by the binary)
    pub input_wav: Option<String>,
}

/// Visualization settings shared by the microphone and playback stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    /// Display frame rate that bounds subscriber notifications
    pub frame_rate_hz: u32,
    /// Analyser window length (power of two)
    pub fft_size: usize,
    /// Time smoothing between analyser frames (0.0..1.0)
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl VisualizationConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate_hz.max(1) as f64)
    }
}

/// Session behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wipe transcript and tool-call history when the session disconnects
    pub clear_messages_on_disconnect: bool,
    /// Utterances whose reorder state is retained at once
    pub max_tracked_utterances: usize,
    /// Fragments held per utterance before eviction starts
    pub max_held_fragments: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                url: "ws://127.0.0.1:8080/v0/chat".to_string(),
                api_key: None,
                config_id: None,
            },
            playback: PlaybackConfig {
                mode: PlaybackMode::Delegated,
                output_device_id: None,
                sample_rate: 48_000,
                source_sample_rate: 24_000,
                volume: 1.0,
                share_audio_clock: false,
                fade_out_ms: 100,
                close_confirm_attempts: 10,
                close_confirm_interval_ms: 50,
                close_attempts: 5,
                close_retry_delay_ms: 100,
                record_path: None,
            },
            microphone: MicrophoneConfig {
                device_id: None,
                sample_rate: 16_000,
                input_wav: None,
            },
            visualization: VisualizationConfig {
                frame_rate_hz: 60,
                fft_size: 2048,
                smoothing: 0.8,
                min_decibels: -100.0,
                max_decibels: -30.0,
            },
            session: SessionConfig {
                clear_messages_on_disconnect: true,
                max_tracked_utterances: 16,
                max_held_fragments: 256,
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, `voice-client.toml` and the environment.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("voice-client").required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.transport.url.is_empty() {
            return Err(anyhow::anyhow!("Transport URL cannot be empty"));
        }

        if self.playback.sample_rate == 0
            || self.playback.source_sample_rate == 0
            || self.microphone.sample_rate == 0
        {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.playback.volume) {
            return Err(anyhow::anyhow!("Volume must be within 0.0..=1.0"));
        }

        if self.playback.close_attempts == 0 {
            return Err(anyhow::anyhow!("Close attempts must be greater than 0"));
        }

        if self.visualization.frame_rate_hz == 0 {
            return Err(anyhow::anyhow!("Frame rate must be greater than 0"));
        }

        if !self.visualization.fft_size.is_power_of_two() || self.visualization.fft_size < 32 {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two of at least 32, got {}",
                self.visualization.fft_size
            ));
        }

        if !(0.0..1.0).contains(&self.visualization.smoothing) {
            return Err(anyhow::anyhow!("Smoothing must be within 0.0..1.0"));
        }

        if self.visualization.min_decibels >= self.visualization.max_decibels {
            return Err(anyhow::anyhow!("min_decibels must be below max_decibels"));
        }

        if self.session.max_tracked_utterances == 0 || self.session.max_held_fragments == 0 {
            return Err(anyhow::anyhow!("Reorder limits must be greater than 0"));
        }

        Ok(())
    }
}
