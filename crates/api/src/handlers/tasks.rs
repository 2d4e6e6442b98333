//! Handlers for job submission and task status.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use taskrelay_core::channels::validate_task_id;
use taskrelay_core::task::{AnalysisRequest, TaskStatusRecord, TaskSubmitted};

use crate::error::AppResult;
use crate::state::AppState;

/// GET /api/v1/
pub async fn api_info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "Task Relay API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/api/v1/analyze": "Submit a product URL for analysis",
            "/api/v1/task/{task_id}": "Check the status of a submitted analysis task",
            "/api/v1/ws": "Stream task progress events",
        }
    }))
}

/// POST /api/v1/analyze
///
/// Queues the job and returns its task id in `pending`.
pub async fn submit_analysis(
    State(state): State<AppState>,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> AppResult<Json<TaskSubmitted>> {
    let Json(request) = payload?;
    tracing::info!(url = %request.url, "Received analysis request");

    let submitted = state.jobs.submit(request).await?;
    tracing::info!(task_id = %submitted.task_id, "Analysis task submitted");
    Ok(Json(submitted))
}

/// GET /api/v1/task/{task_id}
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskStatusRecord>> {
    validate_task_id(&task_id)?;
    let record = state.statuses.get_status(&task_id).await?;
    Ok(Json(record))
}
