//! Client-side view of the followed task.
//!
//! [`TaskFeed`] folds server messages and status polls into what a user
//! interface shows: the followed channel, its event history, and the best
//! known status.
//!
//! - An acknowledgment for a *different* channel starts a fresh history.
//! - Re-acknowledgment of the same channel (after a reconnect) keeps the
//!   history, and events already held are not appended twice.
//! - Poll results override event-derived status when they move it forward,
//!   and always win once terminal.

use taskrelay_core::event::TaskEvent;
use taskrelay_core::messages::ServerMessage;
use taskrelay_core::task::{TaskStatus, TaskStatusRecord};

use crate::controller::ConnectionState;

#[derive(Debug, Clone)]
pub struct TaskFeed {
    connection: ConnectionState,
    channel: Option<String>,
    events: Vec<TaskEvent>,
    status: Option<TaskStatus>,
    result: Option<serde_json::Value>,
    last_error: Option<String>,
}

impl Default for TaskFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskFeed {
    pub fn new() -> Self {
        Self {
            connection: ConnectionState::Idle,
            channel: None,
            events: Vec::new(),
            status: None,
            result: None,
            last_error: None,
        }
    }

    /// Fold one server message. Returns the event when it was appended.
    pub fn apply(&mut self, message: &ServerMessage) -> Option<&TaskEvent> {
        match message {
            ServerMessage::Subscribed { channel } => {
                if self.channel.as_deref() != Some(channel.as_str()) {
                    self.events.clear();
                    self.status = None;
                    self.result = None;
                    self.channel = Some(channel.clone());
                }
                self.last_error = None;
                None
            }
            ServerMessage::Unsubscribed { .. } => {
                self.channel = None;
                None
            }
            ServerMessage::SubscribeFailed { task_id, error } => {
                self.last_error = Some(format!("Subscribe to {task_id} failed: {error}"));
                None
            }
            ServerMessage::Error { message } => {
                self.last_error = Some(message.clone());
                None
            }
            ServerMessage::Event(event) => self.push_event(event),
        }
    }

    /// Fold a status poll result.
    pub fn reconcile(&mut self, record: &TaskStatusRecord) {
        if record.is_terminal() || self.accepts(record.status) {
            self.status = Some(record.status);
        }
        if record.result.is_some() {
            self.result = record.result.clone();
        }
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn events(&self) -> &[TaskEvent] {
        &self.events
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.status
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(TaskStatus::is_terminal)
    }

    fn push_event(&mut self, event: &TaskEvent) -> Option<&TaskEvent> {
        self.channel.as_ref()?;
        if self.events.contains(event) {
            tracing::trace!(agent = %event.agent, "Skipping duplicate event");
            return None;
        }

        if let Some(status) = event.status {
            if self.accepts(status) {
                self.status = Some(status);
            }
        }
        if event.result.is_some() {
            self.result = event.result.clone();
        }
        self.events.push(event.clone());
        self.events.last()
    }

    fn accepts(&self, next: TaskStatus) -> bool {
        match self.status {
            None => true,
            Some(current) => current == next || current.can_transition_to(next),
        }
    }
}
