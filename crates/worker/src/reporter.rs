//! Progress publishing for a single running task.
//!
//! Every status change is written to the [`StatusTracker`] first and only
//! then published on the task channel, so a client that sees a terminal
//! event can always confirm it through the status boundary.

use std::sync::Arc;

use taskrelay_core::channels::ChannelName;
use taskrelay_core::error::CoreError;
use taskrelay_core::event::TaskEvent;
use taskrelay_core::task::TaskStatus;
use taskrelay_events::Broker;

use crate::tracker::StatusTracker;

/// Agent name used for lifecycle events emitted by the worker itself.
pub const WORKER_AGENT: &str = "Worker";

/// Handle given to a pipeline for reporting on one task.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    channel: ChannelName,
    broker: Arc<dyn Broker>,
    tracker: Arc<StatusTracker>,
}

impl ProgressReporter {
    pub fn new(
        task_id: impl Into<String>,
        channel: ChannelName,
        broker: Arc<dyn Broker>,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            channel,
            broker,
            tracker,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Publish a plain progress message.
    pub async fn progress(&self, agent: &str, message: impl Into<String>) {
        self.emit(TaskEvent::new(agent, message)).await;
    }

    /// Mark the task `running` and announce it.
    pub async fn started(&self) -> Result<(), CoreError> {
        self.tracker
            .transition(&self.task_id, TaskStatus::Running, None)
            .await?;
        self.emit(TaskEvent::new(WORKER_AGENT, "Analysis started").with_status(TaskStatus::Running))
            .await;
        Ok(())
    }

    /// Mark the task `success` with `result` and announce it.
    pub async fn succeeded(&self, result: serde_json::Value) -> Result<(), CoreError> {
        self.tracker
            .transition(&self.task_id, TaskStatus::Success, Some(result.clone()))
            .await?;
        self.emit(
            TaskEvent::new(WORKER_AGENT, "Analysis completed")
                .with_status(TaskStatus::Success)
                .with_result(result),
        )
        .await;
        Ok(())
    }

    /// Mark the task `error` and announce it. The stored result is
    /// `{"error": <message>}`.
    pub async fn failed(&self, error: &str) -> Result<(), CoreError> {
        let result = serde_json::json!({ "error": error });
        self.tracker
            .transition(&self.task_id, TaskStatus::Error, Some(result.clone()))
            .await?;
        self.emit(
            TaskEvent::new(WORKER_AGENT, format!("Analysis failed: {error}"))
                .with_status(TaskStatus::Error)
                .with_result(result),
        )
        .await;
        Ok(())
    }

    /// Publishing is best effort: the tracker stays authoritative when the
    /// broker is down.
    async fn emit(&self, event: TaskEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(task_id = %self.task_id, error = %e, "Failed to encode task event");
                return;
            }
        };

        match self.broker.publish(&self.channel, payload).await {
            Ok(receivers) => {
                tracing::debug!(
                    task_id = %self.task_id,
                    channel = %self.channel,
                    receivers,
                    "Task event published"
                );
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    channel = %self.channel,
                    error = %e,
                    "Failed to publish task event"
                );
            }
        }
    }
}
