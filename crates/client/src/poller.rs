//! Periodic task status polling.
//!
//! The status API is authoritative: the event stream may miss events
//! across a reconnect, the poller never does. Polling stops once the task
//! reaches `success` or `error`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskrelay_core::task::TaskStatusRecord;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatusRecord, ClientError>;
}

pub struct StatusPoller {
    source: Arc<dyn StatusSource>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(source: Arc<dyn StatusSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Poll `task_id` until it is terminal or `cancel` fires.
    ///
    /// The first poll happens immediately. Every change of status is sent
    /// on `updates`. Returns the terminal record, or `None` when
    /// cancelled. Failed polls are logged and retried on the next tick.
    pub async fn run(
        &self,
        task_id: &str,
        updates: mpsc::Sender<TaskStatusRecord>,
        cancel: CancellationToken,
    ) -> Option<TaskStatusRecord> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(task_id, "Status polling cancelled");
                    return None;
                }
                _ = ticker.tick() => {}
            }

            let record = match self.source.fetch_status(task_id).await {
                Ok(record) => record,
                Err(ClientError::TaskNotFound(_)) => {
                    tracing::debug!(task_id, "Task not known yet");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Status poll failed");
                    continue;
                }
            };

            if last != Some(record.status) {
                last = Some(record.status);
                tracing::info!(task_id, status = %record.status, "Task status changed");
                // A dropped receiver only loses the notifications.
                let _ = updates.send(record.clone()).await;
            }

            if record.is_terminal() {
                return Some(record);
            }
        }
    }
}
