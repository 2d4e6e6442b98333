//! Connection boundary between the relay client and the network.
//!
//! [`Connector`] opens connections and [`Transport`] is one open
//! connection. [`WsConnector`] is the WebSocket implementation; tests
//! substitute scripted ones.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use taskrelay_core::messages::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::controller::CloseKind;
use crate::error::ClientError;

/// What an open connection produced next.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed(CloseKind),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError>;
}

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError>;

    /// Wait for the next server message or the end of the connection.
    ///
    /// Must be cancel-safe: the driver polls it inside `select!`.
    async fn next_event(&mut self) -> TransportEvent;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Connects to the relay's WebSocket endpoint, e.g.
/// `ws://localhost:8000/api/v1/ws`.
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound on the TCP connect plus the WebSocket handshake. A stalled
    /// handshake counts as a failed attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    ClientError::Connect(format!(
                        "Timed out connecting to {} after {:?}",
                        self.url, self.connect_timeout
                    ))
                })?
                .map_err(|e| {
                    ClientError::Connect(format!("Failed to connect to {}: {e}", self.url))
                })?;

        tracing::debug!(url = %self.url, "WebSocket connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => return TransportEvent::Message(message),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping undecodable server message");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let kind = match frame {
                        Some(frame) if frame.code == CloseCode::Normal => CloseKind::Clean,
                        _ => CloseKind::Abnormal,
                    };
                    tracing::debug!(?kind, "Server closed the connection");
                    return TransportEvent::Closed(kind);
                }
                // Pings are answered by tungstenite on the next read.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    return TransportEvent::Closed(CloseKind::Abnormal);
                }
                None => return TransportEvent::Closed(CloseKind::Abnormal),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
