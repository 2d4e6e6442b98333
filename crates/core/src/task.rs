//! Task lifecycle status and the job submission payloads.
//!
//! Status transitions are monotonic:
//!
//! ```text
//! pending -> running -> success
//!                    \-> error
//! ```
//!
//! A job may also fail before it starts running (`pending -> error`).
//! Once a task is terminal its status never changes again.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default number of products collected per analysis.
pub const DEFAULT_MAX_PRODUCTS: u32 = 10;

/// Default number of competitive products analysed.
pub const DEFAULT_MAX_COMPETITIVE: u32 = 5;

/// Upper bound for `max_products`.
pub const MAX_PRODUCTS_LIMIT: u32 = 50;

/// Upper bound for `max_competitive`.
pub const MAX_COMPETITIVE_LIMIT: u32 = 20;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an analysis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl TaskStatus {
    /// `success` and `error` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }

    /// Whether moving from `self` to `next` respects the monotonic rule.
    ///
    /// Re-asserting the current non-terminal status is allowed so that
    /// producers may repeat `running` on every progress step.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, _) => true,
            (TaskStatus::Running, TaskStatus::Pending) => false,
            (TaskStatus::Running, _) => true,
            (TaskStatus::Success | TaskStatus::Error, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

/// Point-in-time status of a task as reported by the status boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub status: TaskStatus,
    /// Populated only for `success` / `error`.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl TaskStatusRecord {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            result: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/analyze`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Product page to analyse.
    pub url: String,
    #[serde(default = "default_max_products")]
    pub max_products: u32,
    #[serde(default = "default_max_competitive")]
    pub max_competitive: u32,
}

fn default_max_products() -> u32 {
    DEFAULT_MAX_PRODUCTS
}

fn default_max_competitive() -> u32 {
    DEFAULT_MAX_COMPETITIVE
}

impl AnalysisRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_products: DEFAULT_MAX_PRODUCTS,
            max_competitive: DEFAULT_MAX_COMPETITIVE,
        }
    }

    /// Validate the request.
    ///
    /// Rules:
    /// - `url` must be an absolute `http://` or `https://` URL with a host.
    /// - `max_products` must be in `1..=MAX_PRODUCTS_LIMIT`.
    /// - `max_competitive` must be in `1..=MAX_COMPETITIVE_LIMIT`.
    pub fn validate(&self) -> Result<(), CoreError> {
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .ok_or_else(|| {
                CoreError::Validation("url must start with http:// or https://".to_string())
            })?;
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() || self.url.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "url is not a valid absolute URL: {}",
                self.url
            )));
        }
        if !(1..=MAX_PRODUCTS_LIMIT).contains(&self.max_products) {
            return Err(CoreError::Validation(format!(
                "max_products must be between 1 and {MAX_PRODUCTS_LIMIT}"
            )));
        }
        if !(1..=MAX_COMPETITIVE_LIMIT).contains(&self.max_competitive) {
            return Err(CoreError::Validation(format!(
                "max_competitive must be between 1 and {MAX_COMPETITIVE_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// Response of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmitted {
    pub task_id: String,
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    // -- transitions ---------------------------------------------------------

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Error));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn backward_and_post_terminal_transitions_rejected() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Error));
        assert!(!TaskStatus::Error.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Success));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Success).unwrap(),
            serde_json::json!("success")
        );
        let parsed: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }

    // -- AnalysisRequest -----------------------------------------------------

    #[test]
    fn request_defaults_applied() {
        let req: AnalysisRequest =
            serde_json::from_str(r#"{"url": "https://www.amazon.com/dp/B0TEST"}"#).unwrap();
        assert_eq!(req.max_products, DEFAULT_MAX_PRODUCTS);
        assert_eq!(req.max_competitive, DEFAULT_MAX_COMPETITIVE);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_rejects_non_http_url() {
        let req = AnalysisRequest::new("ftp://example.com/x");
        assert_matches!(req.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn request_rejects_missing_host() {
        let req = AnalysisRequest::new("https:///dp/B0TEST");
        assert_matches!(req.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn request_rejects_out_of_range_limits() {
        let mut req = AnalysisRequest::new("https://example.com/p");
        req.max_products = 0;
        assert_matches!(req.validate(), Err(CoreError::Validation(_)));

        req.max_products = MAX_PRODUCTS_LIMIT;
        req.max_competitive = MAX_COMPETITIVE_LIMIT + 1;
        assert_matches!(req.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn status_record_result_defaults_to_none() {
        let rec: TaskStatusRecord =
            serde_json::from_str(r#"{"task_id": "t", "status": "pending"}"#).unwrap();
        assert_eq!(rec, TaskStatusRecord::pending("t"));
        assert!(!rec.is_terminal());
    }
}
