use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use taskrelay_core::channels::ChannelName;
use taskrelay_core::messages::{ClientMessage, ServerMessage};
use taskrelay_core::types::SessionId;
use taskrelay_events::Outbound;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;
use crate::ws::session::{SessionGuard, SessionManager};

/// Upper bound on delivering the close frame to a client being dropped.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /api/v1/ws`: upgrade and wait for control messages.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions, None))
}

/// `GET /ws/{task_id}`: upgrade and subscribe to `task_id` right away.
pub async fn ws_task_handler(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions, Some(task_id)))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket, then:
///   1. Opens a session with the manager.
///   2. Spawns a writer task draining the session's outbound queue.
///   3. Processes inbound control messages on the current task.
///   4. Releases the session when either side ends.
async fn handle_socket(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    initial_task: Option<String>,
) {
    let session = sessions.open().await;
    let session_id = session.id;
    let guard = SessionGuard::new(Arc::clone(&sessions), session_id);
    tracing::info!(session_id = %session_id, "WebSocket connected");

    let (sink, mut stream) = socket.split();
    let heartbeat = sessions.config().heartbeat_interval;
    let close = session.close.clone();
    let mut writer = tokio::spawn(write_loop(
        sink,
        session.outbound,
        session.close,
        heartbeat,
        session_id,
    ));

    if let Some(task_id) = initial_task {
        // Failures are reported to the client as `subscribe_failed`.
        let _ = sessions.on_subscribe(session_id, &task_id).await;
    }

    loop {
        tokio::select! {
            _ = &mut writer => break,
            _ = close.cancelled() => {
                // The writer owns the close frame; it gives up on its own.
                let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT * 2, &mut writer).await;
                tracing::info!(session_id = %session_id, "Session closed by server");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_control(&sessions, session_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(session_id = %session_id, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    guard.close().await;
    writer.abort();
    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}

async fn handle_control(sessions: &SessionManager, session_id: SessionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { task_id }) => {
            let _ = sessions.on_subscribe(session_id, &task_id).await;
        }
        Ok(ClientMessage::Unsubscribe { task_id }) => {
            sessions.on_unsubscribe(session_id, task_id.as_deref()).await;
        }
        Err(e) => {
            tracing::debug!(session_id = %session_id, error = %e, "Invalid control message");
            sessions
                .send_error(session_id, format!("Invalid control message: {e}"))
                .await;
        }
    }
}

/// Forward the session's outbound queue to the socket, interleaving pings.
///
/// A cancelled `close` ends the loop even while a send is blocked on a
/// client that stopped reading.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    close: CancellationToken,
    heartbeat: Duration,
    session_id: SessionId,
) {
    let mut current: Option<ChannelName> = None;
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        let frame = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            item = outbound.recv() => {
                let Some(item) = item else { break };
                let Some(message) = render(&mut current, item) else { continue };
                match message.to_json() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to encode server message");
                        continue;
                    }
                }
            }
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };

        let sent = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            sent = sink.send(frame) => sent,
        };
        if sent.is_err() {
            tracing::debug!(session_id = %session_id, "WebSocket sink closed");
            break;
        }
    }

    if close.is_cancelled()
        && tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(None)))
            .await
            .is_err()
    {
        tracing::debug!(session_id = %session_id, "Client did not take the close frame");
    }
}

/// Turn an outbound item into the message to send, tracking which channel
/// the client currently sees. Events of any other channel are dropped.
///
/// Only `subscribed` and `unsubscribed` move the visible channel. A
/// `subscribe_failed` leaves it alone: a rejected task id keeps the old
/// subscription, and a failed switch has already detached the old channel,
/// so none of its events can follow the failure in the queue.
pub(crate) fn render(current: &mut Option<ChannelName>, item: Outbound) -> Option<ServerMessage> {
    match item {
        Outbound::Subscribed(channel) => {
            let message = ServerMessage::Subscribed {
                channel: channel.to_string(),
            };
            *current = Some(channel);
            Some(message)
        }
        Outbound::Event { channel, event } => {
            if current.as_ref() == Some(&channel) {
                Some(ServerMessage::Event((*event).clone()))
            } else {
                tracing::trace!(channel = %channel, "Dropping event for a channel no longer followed");
                None
            }
        }
        Outbound::Message(message) => {
            if matches!(message, ServerMessage::Unsubscribed { .. }) {
                *current = None;
            }
            Some(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use taskrelay_core::event::TaskEvent;

    use super::*;

    fn channel(task: &str) -> ChannelName {
        ChannelName::for_task("product_analysis", task).unwrap()
    }

    fn event(channel: ChannelName, message: &str) -> Outbound {
        Outbound::Event {
            channel,
            event: Arc::new(TaskEvent::new("Scraper", message)),
        }
    }

    #[test]
    fn events_before_any_ack_are_dropped() {
        let mut current = None;
        assert!(render(&mut current, event(channel("A"), "early")).is_none());
    }

    #[test]
    fn ack_switches_visible_channel() {
        let mut current = None;
        assert_matches!(
            render(&mut current, Outbound::Subscribed(channel("A"))),
            Some(ServerMessage::Subscribed { channel }) if channel == "product_analysis_A"
        );
        assert_matches!(
            render(&mut current, event(channel("A"), "a1")),
            Some(ServerMessage::Event(e)) if e.message == "a1"
        );

        render(&mut current, Outbound::Subscribed(channel("B")));
        assert!(render(&mut current, event(channel("A"), "stale")).is_none());
        assert!(render(&mut current, event(channel("B"), "b1")).is_some());
    }

    #[test]
    fn unsubscribe_clears_visible_channel() {
        let mut current = Some(channel("A"));
        render(
            &mut current,
            Outbound::Message(ServerMessage::Unsubscribed {
                channel: "product_analysis_A".into(),
            }),
        );
        assert!(current.is_none());
        assert!(render(&mut current, event(channel("A"), "late")).is_none());
    }

    #[test]
    fn subscribe_failure_keeps_visible_channel() {
        let mut current = Some(channel("A"));
        assert_matches!(
            render(
                &mut current,
                Outbound::Message(ServerMessage::SubscribeFailed {
                    task_id: "bad id!".into(),
                    error: "invalid task id".into(),
                }),
            ),
            Some(ServerMessage::SubscribeFailed { .. })
        );
        assert_eq!(current, Some(channel("A")));
        assert!(render(&mut current, event(channel("A"), "a2")).is_some());
    }

    #[test]
    fn error_message_keeps_visible_channel() {
        let mut current = Some(channel("A"));
        render(
            &mut current,
            Outbound::Message(ServerMessage::Error {
                message: "bad".into(),
            }),
        );
        assert_eq!(current, Some(channel("A")));
    }
}
