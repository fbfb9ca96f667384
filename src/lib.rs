//! # Voice Duplex Client
//!
//! Client core for realtime duplex voice chat: microphone audio streams out
//! over a socket while interleaved speech fragments and chat events stream
//! back in, get reassembled in order, played gaplessly and turned into
//! visualization data.
//!
//! ## Application Architecture:
//! - **session**: `VoiceSession` coordinates microphone, playback and transport
//! - **router**: dispatches server messages and keeps the transcript
//! - **playback**: gapless fragment scheduling (delegated or direct)
//! - **audio**: decoding, reordering, audio graphs and visualization
//! - **microphone** / **transport**: the two external resources
//! - **config** / **error** / **state**: configuration, errors and status types

pub mod audio;
pub mod config;
pub mod error;
pub mod microphone;
pub mod playback;
pub mod router;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{ClientConfig, PlaybackMode};
pub use error::{AudioError, MicError, SessionError, SocketError};
pub use session::{SessionDeps, VoiceSession};
pub use state::{ConnectOutcome, ResourceStatus, ResourceStatuses, SessionEvent, SessionStatus};
