//! In-memory durable status of submitted tasks.

use std::collections::HashMap;

use async_trait::async_trait;
use taskrelay_core::error::CoreError;
use taskrelay_core::jobs::StatusStore;
use taskrelay_core::task::{TaskStatus, TaskStatusRecord};
use tokio::sync::RwLock;

/// Last known status of every task, enforcing the monotonic transition
/// rule `pending -> running -> {success | error}`.
#[derive(Default)]
pub struct StatusTracker {
    tasks: RwLock<HashMap<String, TaskStatusRecord>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new task in `pending`. Fails if the id is already known.
    pub async fn register(&self, task_id: &str) -> Result<TaskStatusRecord, CoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(task_id) {
            return Err(CoreError::Conflict(format!(
                "task {task_id} is already registered"
            )));
        }
        let record = TaskStatusRecord::pending(task_id);
        tasks.insert(task_id.to_string(), record.clone());
        Ok(record)
    }

    /// Move `task_id` to `status`.
    ///
    /// `result` is only stored for terminal statuses. Transitions out of a
    /// terminal status, or back to `pending`, fail with
    /// [`CoreError::Conflict`].
    pub async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
    ) -> Result<TaskStatusRecord, CoreError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(task_id).ok_or_else(|| CoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;

        if !record.status.can_transition_to(status) {
            return Err(CoreError::Conflict(format!(
                "task {task_id} cannot move from {} to {status}",
                record.status
            )));
        }

        record.status = status;
        record.result = if status.is_terminal() { result } else { None };
        Ok(record.clone())
    }

    /// Number of tracked tasks that have not reached a terminal status.
    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .count()
    }
}

#[async_trait]
impl StatusStore for StatusTracker {
    async fn get_status(&self, task_id: &str) -> Result<TaskStatusRecord, CoreError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })
    }
}
