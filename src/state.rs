//! # Session State
//!
//! Status types shared between the session coordinator and the application.
//!
//! ## Two levels of status:
//! - **ResourceStatus**: one per supervised resource (microphone, playback,
//!   transport). The session is only fully connected when all three are
//!   `Connected`; while any of them is `Disconnecting` or `Disconnected`,
//!   inbound server events are dropped instead of processed.
//! - **SessionStatus**: the overall state the application shows. `Error` is
//!   sticky: it survives the automatic teardown that follows it, so the UI
//!   can show what went wrong until the user acknowledges it.
//!
//! ## Rust Concepts:
//! - **`Copy` enums**: resource statuses are tiny, so they are copied out
//!   of the coordinator's lock instead of borrowed
//! - **Data-carrying variants**: `SessionStatus::Error` holds the error that
//!   caused it, so status and cause can never disagree

use serde::Serialize;
use uuid::Uuid;

use crate::error::SessionError;
use crate::transport::InboundEvent;

/// Lifecycle of one supervised resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ResourceStatus {
    /// `Disconnecting` or `Disconnected`.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ResourceStatus::Disconnecting | ResourceStatus::Disconnected
        )
    }
}

/// Status of the microphone, the playback engine and the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceStatuses {
    pub microphone: ResourceStatus,
    pub playback: ResourceStatus,
    pub transport: ResourceStatus,
}

impl ResourceStatuses {
    pub fn all(status: ResourceStatus) -> Self {
        Self {
            microphone: status,
            playback: status,
            transport: status,
        }
    }

    pub fn all_connected(&self) -> bool {
        self.iter().all(|s| s == ResourceStatus::Connected)
    }

    /// True when any resource is going or gone away.
    pub fn any_down(&self) -> bool {
        self.iter().any(ResourceStatus::is_down)
    }

    /// Mark every resource that is still up as `Disconnecting`.
    pub fn begin_disconnect(&mut self) {
        for status in [
            &mut self.microphone,
            &mut self.playback,
            &mut self.transport,
        ] {
            if *status != ResourceStatus::Disconnected {
                *status = ResourceStatus::Disconnecting;
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = ResourceStatus> {
        [self.microphone, self.playback, self.transport].into_iter()
    }
}

impl Default for ResourceStatuses {
    fn default() -> Self {
        Self::all(ResourceStatus::Disconnected)
    }
}

/// Overall session status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(SessionError),
}

impl SessionStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SessionStatus::Error(_))
    }
}

/// Result of a call to `VoiceSession::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// All three resources are up
    Connected,
    /// A connect attempt is in flight or the session is connected already;
    /// nothing was changed
    AlreadyActive,
    /// A disconnect arrived while connecting; everything acquired was released
    Cancelled,
}

/// Notifications broadcast to session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { session_id: Uuid },
    StatusChanged(SessionStatus),
    /// A server message accepted for processing
    Message(InboundEvent),
    /// Fragment 0 of an utterance started playing
    AudioStarted { utterance_id: String },
    AudioStopped,
    QueueLength(usize),
    Error(SessionError),
    /// The server (or network) closed the connection
    TransportClosed { code: u16, reason: String },
    /// Teardown finished
    Disconnected,
}
