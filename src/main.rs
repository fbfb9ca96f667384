//! # Voice Client - Main Application Entry Point
//!
//! Command-line front end for the voice duplex client. It connects one
//! `VoiceSession` to the configured server and runs until Ctrl-C or until
//! the server closes the conversation.
//!
//! ## What runs where:
//! - **Microphone**: fed in real time from `microphone.input_wav` if set,
//!   otherwise silent
//! - **Playback**: rendered by the software audio graph, optionally recorded
//!   to `playback.record_path`
//! - **Events**: session events and the final transcript are logged
//!
//! ## Environment Variables:
//! - `RUST_LOG`: log filter (defaults to `voice_duplex_client=debug,info`)
//! - `VOICE__TRANSPORT__URL`, `VOICE__TRANSPORT__API_KEY`, ...: configuration
//!   overrides, see `config.rs`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex_client::audio::fragment::decode_wav;
use voice_duplex_client::audio::software::SoftwareHost;
use voice_duplex_client::audio::visualization::FrameTicker;
use voice_duplex_client::microphone::ChannelMicrophone;
use voice_duplex_client::transport::websocket::WsTransport;
use voice_duplex_client::transport::InboundEvent;
use voice_duplex_client::{ClientConfig, SessionDeps, SessionEvent, VoiceSession};

/// Length of each microphone chunk fed from the input file.
const FEED_CHUNK: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = ClientConfig::load()?;
    config.validate()?;

    info!("Starting voice-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Server: {} (playback {:?} at {} Hz)",
        config.transport.url, config.playback.mode, config.playback.sample_rate
    );

    let mut host = SoftwareHost::new(config.playback.sample_rate, config.visualization.clone());
    if let Some(path) = &config.playback.record_path {
        info!("Recording playback to {}", path);
        host = host.with_recording(path);
    }

    let input = match &config.microphone.input_wav {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path))?;
            let (samples, sample_rate) =
                decode_wav(&bytes).with_context(|| format!("cannot decode {}", path))?;
            info!(
                "Microphone input: {} ({:.1}s at {} Hz)",
                path,
                samples.len() as f64 / sample_rate as f64,
                sample_rate
            );
            Some((samples, sample_rate))
        }
        None => None,
    };
    let mic_rate = input
        .as_ref()
        .map(|(_, rate)| *rate)
        .unwrap_or(config.microphone.sample_rate);
    let (microphone, feed) = ChannelMicrophone::new(mic_rate, 1);

    let deps = SessionDeps {
        audio_host: Arc::new(host),
        microphone: Arc::new(microphone),
        transport: Arc::new(WsTransport::new()),
        frames: FrameTicker::spawn(config.visualization.frame_interval()),
    };
    let session = VoiceSession::new(config, deps);
    let mut events = session.subscribe();

    let outcome = session.connect().await?;
    info!("Session {} connect: {:?}", session.id(), outcome);

    // Without input the sender stays alive so capture keeps running silently
    let (feeder, _idle_feed) = match input {
        Some((samples, sample_rate)) => (
            Some(tokio::spawn(feed_realtime(feed, samples, sample_rate))),
            None,
        ),
        None => (None, Some(feed)),
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Disconnected) => {
                    info!("Session ended");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log fell behind, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    for entry in session.messages() {
        info!("[{:?}] {}", entry.role, entry.content);
    }

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    session.disconnect().await;

    if let Some(e) = session.last_error() {
        error!("Session finished with error: {}", e);
    }
    info!("Voice client stopped");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls the filter; without it the crate logs at debug and
/// everything else at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_duplex_client=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Push `samples` into the microphone at the pace a real device would.
async fn feed_realtime(feed: mpsc::Sender<Vec<f32>>, samples: Vec<f32>, sample_rate: u32) {
    let chunk_len = ((sample_rate as u128 * FEED_CHUNK.as_millis()) / 1000).max(1) as usize;
    let mut ticker = tokio::time::interval(FEED_CHUNK);
    for chunk in samples.chunks(chunk_len) {
        ticker.tick().await;
        if feed.send(chunk.to_vec()).await.is_err() {
            break;
        }
    }
    info!("Microphone input finished");
    // Silence keeps the stream open after the file ends
    let silence = vec![0.0; chunk_len];
    loop {
        ticker.tick().await;
        if feed.send(silence.clone()).await.is_err() {
            break;
        }
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Message(InboundEvent::AudioOutput { id, index, .. }) => {
            debug!("Audio fragment {}#{}", id, index);
        }
        SessionEvent::Message(message) => info!("Server message: {}", message.kind()),
        SessionEvent::QueueLength(length) => debug!("Playback queue: {}", length),
        SessionEvent::Error(e) => warn!("Session error [{}]: {}", e.kind(), e),
        other => info!("{:?}", other),
    }
}
