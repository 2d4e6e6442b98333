//! Integration tests for job submission and task status routes.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, get, post_json};
use taskrelay_core::task::TaskStatus;

const URL: &str = "https://shop.example.com/item/42";

// ---------------------------------------------------------------------------
// Test: API info lists endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn api_info_lists_endpoints() {
    let app = common::build_test_app();
    let response = get(app.router.clone(), "/api/v1/").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["endpoints"]["/api/v1/analyze"].is_string());
}

#[tokio::test]
async fn api_info_served_without_trailing_slash() {
    let app = common::build_test_app();
    let response = get(app.router.clone(), "/api/v1").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["endpoints"].is_object());
}

// ---------------------------------------------------------------------------
// Test: POST /analyze returns a pending task id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_pending_task() {
    let app = common::build_test_app();
    let body = format!(r#"{{"url": "{URL}"}}"#);
    let response = post_json(app.router.clone(), "/api/v1/analyze", &body).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "pending");
    assert!(json["task_id"].as_str().is_some_and(|id| !id.is_empty()));
}

// ---------------------------------------------------------------------------
// Test: invalid submissions are 4xx
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_rejects_relative_url() {
    let app = common::build_test_app();
    let response = post_json(
        app.router.clone(),
        "/api/v1/analyze",
        r#"{"url": "/item/42"}"#,
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn submit_rejects_out_of_range_limits() {
    let app = common::build_test_app();
    let body = format!(r#"{{"url": "{URL}", "max_products": 51}}"#);
    let response = post_json(app.router.clone(), "/api/v1/analyze", &body).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn submit_rejects_malformed_json() {
    let app = common::build_test_app();
    let response = post_json(app.router.clone(), "/api/v1/analyze", "{not json").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
}

// ---------------------------------------------------------------------------
// Test: GET /task/{id}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_task_is_404() {
    let app = common::build_test_app();
    let response = get(app.router.clone(), "/api/v1/task/does-not-exist").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn known_task_reports_status() {
    let app = common::build_test_app();
    app.tracker.register("T1").await.unwrap();

    let response = get(app.router.clone(), "/api/v1/task/T1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["task_id"], "T1");
    assert_eq!(json["status"], "pending");
    assert!(json["result"].is_null());
}

#[tokio::test]
async fn submitted_task_eventually_succeeds() {
    let app = common::build_test_app();
    let body = format!(r#"{{"url": "{URL}", "max_competitive": 2}}"#);
    let submitted = body_json(post_json(app.router.clone(), "/api/v1/analyze", &body).await).await;
    let task_id = submitted["task_id"].as_str().unwrap().to_string();

    let uri = format!("/api/v1/task/{task_id}");
    let mut json = serde_json::Value::Null;
    for _ in 0..200 {
        json = body_json(get(app.router.clone(), &uri).await).await;
        if json["status"] == TaskStatus::Success.as_str() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(json["status"], "success");
    assert_eq!(
        json["result"]["report"]["competitive_products"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}
