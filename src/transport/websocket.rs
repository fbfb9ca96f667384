//! # WebSocket Transport
//!
//! `Transport` over tokio-tungstenite. A connection runs two tasks:
//!
//! - **Writer**: drains an unbounded queue of outgoing frames into the socket,
//!   so `send()` never blocks the caller
//! - **Reader**: parses text frames into `InboundEvent`s and reports the
//!   close code when the server or the network ends the connection
//!
//! The API key travels as a bearer token on the upgrade request and the
//! optional configuration id as a `config_id` query parameter.

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::{ConnectOptions, InboundEvent, Transport, TransportEvent};
use crate::error::SocketError;

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct WsShared {
    connection: Mutex<Option<Connection>>,
    open: AtomicBool,
}

/// WebSocket client transport.
#[derive(Clone, Default)]
pub struct WsTransport {
    shared: Arc<WsShared>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the upgrade request for `options`.
pub fn build_request(
    options: &ConnectOptions,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SocketError> {
    let url = match &options.config_id {
        Some(config_id) => {
            let separator = if options.url.contains('?') { '&' } else { '?' };
            format!("{}{}config_id={}", options.url, separator, config_id)
        }
        None => options.url.clone(),
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SocketError::ConnectionFailure(format!("invalid URL '{}': {}", url, e)))?;

    if let Some(api_key) = &options.api_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| SocketError::ConnectionFailure(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    Ok(request)
}

impl Transport for WsTransport {
    fn connect(
        &self,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> BoxFuture<'static, Result<(), SocketError>> {
        let shared = self.shared.clone();
        async move {
            if shared.open.load(Ordering::SeqCst) {
                return Err(SocketError::ConnectionFailure(
                    "transport is already connected".to_string(),
                ));
            }

            let request = build_request(&options)?;
            let (stream, response) = connect_async(request).await.map_err(|e| {
                SocketError::ConnectionFailure(format!("cannot reach {}: {}", options.url, e))
            })?;
            info!("WebSocket connected to {} ({})", options.url, response.status());

            let (mut sink, mut source) = stream.split();
            let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
            shared.open.store(true, Ordering::SeqCst);

            let writer_events = events.clone();
            let writer = tokio::spawn(async move {
                while let Some(message) = outgoing_rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        error!("WebSocket send failed: {}", e);
                        let _ = writer_events.send(TransportEvent::Error(SocketError::SendFailure(
                            e.to_string(),
                        )));
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let reader_shared = shared.clone();
            let reader = tokio::spawn(async move {
                let (code, reason) = loop {
                    match source.next().await {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundEvent>(&text) {
                                Ok(event) => {
                                    let _ = events.send(TransportEvent::Message(event));
                                }
                                Err(e) => warn!("Ignoring unparseable server message: {}", e),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("Ignoring {} byte binary frame from server", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                                None => (1005, String::new()),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket protocol error: {}", e);
                            let _ = events.send(TransportEvent::Error(
                                SocketError::ConnectionFailure(e.to_string()),
                            ));
                            break (ABNORMAL_CLOSURE, e.to_string());
                        }
                        None => break (ABNORMAL_CLOSURE, "connection lost".to_string()),
                    }
                };

                reader_shared.open.store(false, Ordering::SeqCst);
                info!("WebSocket closed by server: {} {}", code, reason);
                let _ = events.send(TransportEvent::Closed { code, reason });
            });

            *shared.connection.lock() = Some(Connection {
                outgoing,
                reader,
                writer,
            });
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'static, ()> {
        let shared = self.shared.clone();
        async move {
            let connection = shared.connection.lock().take();
            let Some(connection) = connection else {
                return;
            };
            shared.open.store(false, Ordering::SeqCst);

            // Local close: the reader must not report it as a server close
            connection.reader.abort();
            let _ = connection.outgoing.send(Message::Close(None));
            drop(connection.outgoing);

            let mut writer = connection.writer;
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                warn!("WebSocket writer did not finish in time, aborting");
                writer.abort();
            }
            info!("WebSocket disconnected");
        }
        .boxed()
    }

    fn send(&self, data: Vec<u8>) -> Result<(), SocketError> {
        self.enqueue(Message::Binary(data.into()))
    }

    fn send_text(&self, text: String) -> Result<(), SocketError> {
        self.enqueue(Message::Text(text.into()))
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}

impl WsTransport {
    fn enqueue(&self, message: Message) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::SendFailure("socket is not open".to_string()));
        }
        let connection = self.shared.connection.lock();
        let connection = connection
            .as_ref()
            .ok_or_else(|| SocketError::SendFailure("socket is not open".to_string()))?;
        connection
            .outgoing
            .send(message)
            .map_err(|_| SocketError::SendFailure("socket writer has stopped".to_string()))
    }
}
