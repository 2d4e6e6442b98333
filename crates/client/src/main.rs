use std::sync::Arc;

use anyhow::Context;
use taskrelay_client::config::{WatchConfig, WatchTarget};
use taskrelay_client::{
    ApiClient, ClientEvent, RelayClient, StatusPoller, TaskFeed, WsConnector,
};
use taskrelay_core::messages::ServerMessage;
use taskrelay_core::task::TaskStatus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WatchConfig::from_env()?;
    let api = Arc::new(ApiClient::new(config.http_url.clone()));

    let task_id = match &config.target {
        WatchTarget::Task(task_id) => task_id.clone(),
        WatchTarget::Submit(request) => {
            let submitted = api
                .submit(request)
                .await
                .with_context(|| format!("Failed to submit analysis for {}", request.url))?;
            tracing::info!(task_id = %submitted.task_id, url = %request.url, "Analysis submitted");
            submitted.task_id
        }
    };

    // --- Event stream ---
    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
    let (client, mut events, client_handle) = RelayClient::spawn(connector, config.reconnect);
    client.follow(task_id.clone()).await?;

    // --- Status polling ---
    let cancel = CancellationToken::new();
    let (status_tx, mut statuses) = mpsc::channel(16);
    let poller = StatusPoller::new(api, config.poll_interval);
    let poll_task = {
        let task_id = task_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { poller.run(&task_id, status_tx, cancel).await })
    };

    let mut feed = TaskFeed::new();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                tracing::info!("Interrupted");
                break;
            }
            Some(event) = events.recv() => match event {
                ClientEvent::State(state) => {
                    feed.set_connection(state);
                    tracing::info!(%state, "Relay connection");
                }
                ClientEvent::Message(message) => {
                    match &message {
                        ServerMessage::Subscribed { channel } => {
                            tracing::info!(%channel, "Following");
                        }
                        ServerMessage::SubscribeFailed { error, .. }
                        | ServerMessage::Error { message: error } => {
                            tracing::warn!(%error, "Relay reported an error");
                        }
                        _ => {}
                    }
                    if let Some(event) = feed.apply(&message) {
                        tracing::info!(
                            agent = %event.agent,
                            status = ?event.status,
                            "{}",
                            event.message
                        );
                    }
                }
            },
            Some(record) = statuses.recv() => {
                feed.reconcile(&record);
            }
        }

        if feed.is_terminal() {
            break;
        }
    }

    cancel.cancel();
    client.shutdown();
    let _ = poll_task.await;
    let _ = client_handle.await;

    match feed.status() {
        Some(TaskStatus::Success) => {
            if let Some(result) = feed.result() {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            Ok(())
        }
        Some(TaskStatus::Error) => {
            anyhow::bail!("Task {task_id} failed: {:?}", feed.result())
        }
        _ => Ok(()),
    }
}

/// `RUST_LOG` selects levels; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "taskrelay_client=info,taskrelay_watch=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
