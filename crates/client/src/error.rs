/// Errors raised by the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The WebSocket handshake did not complete.
    #[error("Connection error: {0}")]
    Connect(String),

    /// An established connection failed while reading or writing.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection went away without a normal close.
    #[error("Connection closed abnormally")]
    TransportClosedAbnormally,

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The client task has stopped.
    #[error("Relay client has shut down")]
    Closed,
}
