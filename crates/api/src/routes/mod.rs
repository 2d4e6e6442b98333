pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /                     API info
/// /analyze              submit an analysis job (POST)
/// /task/{task_id}       task status
/// /ws                   WebSocket, subscribe via control messages
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::tasks::api_info))
        .route("/analyze", post(handlers::tasks::submit_analysis))
        .route("/task/{task_id}", get(handlers::tasks::get_task_status))
        .route("/ws", get(ws::ws_handler))
}

/// `/api/v1/` with the trailing slash. A nested `/` only matches the bare
/// prefix.
pub fn api_index_router() -> Router<AppState> {
    Router::new().route("/api/v1/", get(handlers::tasks::api_info))
}

/// Root-level WebSocket route that subscribes to the task in the path on
/// connect.
pub fn task_socket_router() -> Router<AppState> {
    Router::new().route("/ws/{task_id}", get(ws::ws_task_handler))
}
