//! Relay error taxonomy.
//!
//! Registry-level errors are returned to the session layer, which turns
//! them into a negative acknowledgment for the requesting client. They are
//! never propagated to sessions on other channels.
//!
//! Detaching a channel that has no entry is not an error: see
//! [`DetachOutcome::NotFound`](crate::registry::DetachOutcome::NotFound).

use taskrelay_core::error::CoreError;
use taskrelay_core::types::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Opening the upstream subscription failed; no entry was created.
    #[error("Channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    /// An upstream payload could not be decoded into a task event.
    #[error("Malformed event on {channel}: {reason}")]
    MalformedEvent { channel: String, reason: String },

    /// The task id in a subscribe request was rejected.
    #[error(transparent)]
    InvalidTask(#[from] CoreError),

    /// The session's outbound queue is full.
    #[error("Session {0} is not accepting messages")]
    SessionBackpressure(SessionId),

    /// The session was closed, or never opened.
    #[error("Session {0} is not open")]
    UnknownSession(SessionId),

    /// The registry has been shut down and accepts no new interest.
    #[error("Channel registry is shut down")]
    ShuttingDown,
}
