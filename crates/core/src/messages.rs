//! WebSocket wire messages.
//!
//! Client → server control messages are tagged by `"op"`; server → client
//! messages are tagged by `"type"`. Task ids travel as `taskId` (the
//! snake_case `task_id` spelling is accepted on input).

use serde::{Deserialize, Serialize};

use crate::event::TaskEvent;

/// Control message sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Follow the given task, replacing any current subscription.
    Subscribe {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
    },
    /// Stop following. When `task_id` is given it must name the task
    /// currently followed, otherwise the request is ignored.
    Unsubscribe {
        #[serde(
            rename = "taskId",
            alias = "task_id",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        task_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn subscribe(task_id: impl Into<String>) -> Self {
        ClientMessage::Subscribe {
            task_id: task_id.into(),
        }
    }

    pub fn unsubscribe(task_id: impl Into<String>) -> Self {
        ClientMessage::Unsubscribe {
            task_id: Some(task_id.into()),
        }
    }
}

/// Message sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session now follows `channel`; its event history starts empty.
    Subscribed { channel: String },

    /// The session no longer follows `channel`.
    Unsubscribed { channel: String },

    /// A subscribe request could not be honoured.
    SubscribeFailed {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
        error: String,
    },

    /// A progress event on the followed channel.
    Event(TaskEvent),

    /// The last control message was not understood.
    Error { message: String },
}

impl ServerMessage {
    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
