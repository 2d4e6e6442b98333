use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskrelay_api::config::ServerConfig;
use taskrelay_api::router::build_app_router;
use taskrelay_api::state::AppState;
use taskrelay_events::{Broker, ChannelRegistry, InMemoryBroker};
use taskrelay_worker::{ScriptedPipeline, StatusTracker, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, prefix = %config.channel_prefix, "Loaded server configuration");

    // --- Broker and channel registry ---
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let registry = Arc::new(ChannelRegistry::new(
        Arc::clone(&broker),
        config.registry_config(),
    ));

    // --- Worker pool ---
    let tracker = Arc::new(StatusTracker::new());
    let worker_cancel = CancellationToken::new();
    let (pool, worker_handle) = WorkerPool::start(
        config.worker_config(),
        Arc::clone(&broker),
        Arc::clone(&tracker),
        Arc::new(ScriptedPipeline::default()),
        worker_cancel.clone(),
    );
    tracing::info!(concurrency = config.worker_concurrency, "Worker pool started");

    // --- App state ---
    let state = AppState::new(config.clone(), Arc::clone(&registry), Arc::new(pool), tracker);
    let sessions = Arc::clone(&state.sessions);
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    let signal_sessions = Arc::clone(&sessions);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded connections are not drained by the server itself.
            signal_sessions.shutdown_all().await;
        })
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let cleanup = async {
        sessions.shutdown_all().await;

        worker_cancel.cancel();
        if let Err(e) = worker_handle.await {
            tracing::error!(error = %e, "Worker pool task failed");
        }
        tracing::info!("Worker pool stopped");

        let closed = registry.shutdown().await;
        tracing::info!(closed, "Upstream subscriptions closed");
    };

    if tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), cleanup)
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Cleanup did not finish in time"
        );
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// `RUST_LOG` selects levels; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "taskrelay_api=debug,taskrelay_events=debug,taskrelay_worker=info,tower_http=debug".into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
