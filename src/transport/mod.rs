//! # Transport
//!
//! The session talks to the voice server through the `Transport` trait:
//! binary frames carry microphone audio out, JSON text frames carry
//! control messages both ways.
//!
//! ## Event flow:
//! - Parsed inbound messages, errors and the close notification are sent to
//!   the `TransportEvent` channel passed to `connect()`
//! - A close reported through the channel means the server (or the network)
//!   ended the connection; a local `disconnect()` reports nothing
//!
//! `websocket::WsTransport` implements the trait over tokio-tungstenite.

pub mod protocol;
pub mod websocket;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::SocketError;

pub use self::protocol::{ChatMessage, InboundEvent, OutboundMessage};

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub url: String,
    pub api_key: Option<String>,
    pub config_id: Option<String>,
}

impl From<&TransportConfig> for ConnectOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            config_id: config.config_id.clone(),
        }
    }
}

/// Notifications from an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundEvent),
    Error(SocketError),
    Closed { code: u16, reason: String },
}

pub trait Transport: Send + Sync {
    /// Open the connection; events flow into `events` until it closes.
    fn connect(
        &self,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> BoxFuture<'static, Result<(), SocketError>>;

    /// Close the connection if open. Never fails.
    fn disconnect(&self) -> BoxFuture<'static, ()>;

    /// Send a binary frame.
    fn send(&self, data: Vec<u8>) -> Result<(), SocketError>;

    /// Send a text frame.
    fn send_text(&self, text: String) -> Result<(), SocketError>;

    fn is_open(&self) -> bool;

    /// Serialize and send a control message.
    fn send_message(&self, message: &OutboundMessage) -> Result<(), SocketError> {
        let text = serde_json::to_string(message)
            .map_err(|e| SocketError::SendFailure(format!("cannot encode message: {}", e)))?;
        self.send_text(text)
    }
}
