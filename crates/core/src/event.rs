//! Task progress events.
//!
//! A [`TaskEvent`] is what producers publish on a task channel and what
//! clients receive (wrapped as `{"type": "event", ...}`). Events are not
//! persisted by the relay.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::task::TaskStatus;
use crate::types::Timestamp;

/// A unit of progress information for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Free-form producer identifier, e.g. `"Scraper"`.
    #[serde(default, alias = "source")]
    pub agent: String,

    /// Human-readable progress text.
    #[serde(default)]
    pub message: String,

    /// When the producer emitted the event. Defaults to decode time when
    /// the producer omits it.
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    /// Opaque payload, present only on terminal events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskEvent {
    /// Create a plain progress event stamped with the current time.
    pub fn new(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            message: message.into(),
            timestamp: Utc::now(),
            status: None,
            result: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// An event with no producer, no text and no status carries nothing
    /// worth relaying.
    pub fn is_blank(&self) -> bool {
        self.agent.is_empty() && self.message.is_empty() && self.status.is_none()
    }

    /// Whether this event reports a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(TaskStatus::is_terminal)
    }
}
