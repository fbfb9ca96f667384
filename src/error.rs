//! # Error Handling
//!
//! Error taxonomy for the three resources a voice session supervises:
//! the microphone, the playback engine and the transport socket.
//!
//! ## Propagation rules:
//! - **Per-fragment failures** (`AudioError::MalformedFragment`) are reported
//!   but never abort the session; playback continues with later fragments.
//! - **Initialization failures** abort the connect sequence immediately.
//! - **Closure failures** are reported after teardown retries are exhausted,
//!   and never block the remaining teardown steps.
//!
//! Every error exposes a stable snake_case code through `kind()` so that
//! applications can match on it without parsing messages.

use thiserror::Error;

/// Failures of the microphone resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MicError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone initialization failed: {0}")]
    InitializationFailure(String),

    #[error("Microphone failed to close: {0}")]
    ClosureFailure(String),

    #[error("Unsupported microphone format: {0}")]
    UnsupportedFormat(String),
}

impl MicError {
    pub fn kind(&self) -> &'static str {
        match self {
            MicError::PermissionDenied(_) => "permission_denied",
            MicError::InitializationFailure(_) => "initialization_failure",
            MicError::ClosureFailure(_) => "closure_failure",
            MicError::UnsupportedFormat(_) => "unsupported_format",
        }
    }
}

/// Failures of the playback engine and its audio graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio initialization failed: {0}")]
    InitializationFailure(String),

    #[error("Audio rendering unit unavailable: {0}")]
    WorkletUnavailable(String),

    #[error("Playback engine used before initialization")]
    NotInitialized,

    #[error("Malformed audio fragment: {0}")]
    MalformedFragment(String),

    #[error("Audio graph failed to close: {0}")]
    ClosureFailure(String),
}

impl AudioError {
    pub fn kind(&self) -> &'static str {
        match self {
            AudioError::InitializationFailure(_) => "initialization_failure",
            AudioError::WorkletUnavailable(_) => "worklet_unavailable",
            AudioError::NotInitialized => "not_initialized",
            AudioError::MalformedFragment(_) => "malformed_fragment",
            AudioError::ClosureFailure(_) => "closure_failure",
        }
    }
}

/// Failures of the transport socket, including errors the server reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailure(String),

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("Server error {code}: {message}")]
    RemoteErrorMessage { code: String, message: String },
}

impl SocketError {
    pub fn kind(&self) -> &'static str {
        match self {
            SocketError::ConnectionFailure(_) => "connection_failure",
            SocketError::SendFailure(_) => "send_failure",
            SocketError::RemoteErrorMessage { .. } => "remote_error_message",
        }
    }
}

/// Unified error surfaced by a voice session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("mic_error: {0}")]
    Mic(#[from] MicError),

    #[error("audio_error: {0}")]
    Audio(#[from] AudioError),

    #[error("socket_error: {0}")]
    Socket(#[from] SocketError),
}

impl SessionError {
    /// Resource category: `mic_error`, `audio_error` or `socket_error`.
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::Mic(_) => "mic_error",
            SessionError::Audio(_) => "audio_error",
            SessionError::Socket(_) => "socket_error",
        }
    }

    /// Specific failure code within the category.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Mic(e) => e.kind(),
            SessionError::Audio(e) => e.kind(),
            SessionError::Socket(e) => e.kind(),
        }
    }

    /// Closure failures come from teardown and never trigger another teardown.
    pub fn is_closure_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Mic(MicError::ClosureFailure(_))
                | SessionError::Audio(AudioError::ClosureFailure(_))
        )
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
