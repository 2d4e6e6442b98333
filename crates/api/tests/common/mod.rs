#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use taskrelay_api::config::ServerConfig;
use taskrelay_api::router::build_app_router;
use taskrelay_api::state::AppState;
use taskrelay_events::{ChannelRegistry, InMemoryBroker};
use taskrelay_worker::{ScriptedPipeline, StatusTracker, WorkerPool};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        session_buffer: 32,
        broker_timeout_secs: 1,
        ..ServerConfig::default()
    }
}

/// Everything a test needs to drive the server and its collaborators.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub broker: InMemoryBroker,
    pub tracker: Arc<StatusTracker>,
    pub worker_cancel: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.worker_cancel.cancel();
    }
}

/// Build the full application with an in-memory broker and a fast
/// scripted worker pool.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config())
}

pub fn build_test_app_with(config: ServerConfig) -> TestApp {
    let broker = InMemoryBroker::default();
    let registry = Arc::new(ChannelRegistry::new(
        Arc::new(broker.clone()),
        config.registry_config(),
    ));
    let tracker = Arc::new(StatusTracker::new());
    let worker_cancel = CancellationToken::new();
    let (pool, _handle) = WorkerPool::start(
        config.worker_config(),
        Arc::new(broker.clone()),
        Arc::clone(&tracker),
        Arc::new(ScriptedPipeline::new(Duration::from_millis(5))),
        worker_cancel.clone(),
    );

    let state = AppState::new(
        config.clone(),
        registry,
        Arc::new(pool),
        Arc::clone(&tracker) as Arc<dyn taskrelay_core::jobs::StatusStore>,
    );
    let router = build_app_router(state.clone(), &config);

    TestApp {
        router,
        state,
        broker,
        tracker,
        worker_cancel,
    }
}

/// Serve `router` on an ephemeral port and return its address.
pub async fn spawn_server(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
