//! Boundaries to the external job system.
//!
//! The relay never runs analyses itself. It submits work through a
//! [`JobQueue`] and reads durable status through a [`StatusStore`].

use async_trait::async_trait;

use crate::error::CoreError;
use crate::task::{AnalysisRequest, TaskStatusRecord, TaskSubmitted};

/// Accepts analysis jobs and hands back a task identifier.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. The returned task starts in `pending`.
    ///
    /// Fails with [`CoreError::Validation`] for malformed requests.
    async fn submit(&self, request: AnalysisRequest) -> Result<TaskSubmitted, CoreError>;
}

/// Read side of durable task status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current status of `task_id`, or [`CoreError::NotFound`].
    async fn get_status(&self, task_id: &str) -> Result<TaskStatusRecord, CoreError>;
}
