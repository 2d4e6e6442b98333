//! Per-connection session management.
//!
//! A session follows at most one task channel. Subscribing to another task
//! switches: the old channel is detached before the new one is attached.
//! Every successful attach is matched by exactly one detach, whether it is
//! triggered by `unsubscribe`, a switch, or the connection going away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use taskrelay_core::channels::{ChannelName, DEFAULT_CHANNEL_PREFIX};
use taskrelay_core::messages::ServerMessage;
use taskrelay_core::types::SessionId;
use taskrelay_events::registry::SessionSink;
use taskrelay_events::{ChannelRegistry, Outbound, RelayError, Subscriber};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_prefix: String,
    /// Capacity of each session's outbound queue.
    pub buffer: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            buffer: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Transport-side half of a freshly opened session.
pub struct SessionHandle {
    pub id: SessionId,
    /// Everything to be written to the client, in order.
    pub outbound: mpsc::Receiver<Outbound>,
    /// Cancelled when the session must be closed from the server side.
    pub close: CancellationToken,
}

struct SessionState {
    subscriber: Subscriber,
    sink: SessionSink,
    close: CancellationToken,
    subscribed: Option<Subscription>,
    closed: bool,
}

#[derive(Clone)]
struct Subscription {
    task_id: String,
    channel: ChannelName,
}

/// Tracks every connected session and the channel it follows.
pub struct SessionManager {
    registry: Arc<ChannelRegistry>,
    config: SessionConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    pub fn new(registry: Arc<ChannelRegistry>, config: SessionConfig) -> Self {
        Self {
            registry,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a new session with no subscription.
    pub async fn open(&self) -> SessionHandle {
        let id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.buffer.max(2));
        let close = CancellationToken::new();

        let state = SessionState {
            subscriber: Subscriber::new(id, tx.clone(), close.clone()),
            sink: tx,
            close: close.clone(),
            subscribed: None,
            closed: false,
        };
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(state)));
        tracing::info!(session_id = %id, "Session opened");

        SessionHandle {
            id,
            outbound: rx,
            close,
        }
    }

    /// Follow `task_id`, replacing any different current subscription.
    ///
    /// On success the subscribe acknowledgment has been queued ahead of any
    /// event of the new channel. On failure the client is sent a
    /// `subscribe_failed` message and the error is returned.
    pub async fn on_subscribe(
        &self,
        session_id: SessionId,
        task_id: &str,
    ) -> Result<ChannelName, RelayError> {
        let session = self
            .get(session_id)
            .await
            .ok_or(RelayError::UnknownSession(session_id))?;
        let mut state = session.lock().await;
        if state.closed {
            return Err(RelayError::UnknownSession(session_id));
        }

        let channel = match ChannelName::for_task(&self.config.channel_prefix, task_id) {
            Ok(channel) => channel,
            Err(e) => {
                let err = RelayError::from(e);
                state.reject(task_id, &err);
                return Err(err);
            }
        };

        if let Some(current) = &state.subscribed {
            if current.channel == channel {
                // Same channel: acknowledge again, keep the interest.
                state.enqueue(Outbound::Subscribed(channel.clone()));
                tracing::debug!(session_id = %session_id, channel = %channel, "Re-acknowledged existing subscription");
                return Ok(channel);
            }
        }

        if let Some(previous) = state.subscribed.take() {
            self.registry.detach(&previous.channel, session_id).await;
            tracing::info!(
                session_id = %session_id,
                from = %previous.channel,
                to = %channel,
                "Switching subscription"
            );
        }

        match self
            .registry
            .attach(&channel, state.subscriber.clone())
            .await
        {
            Ok(attachment) => {
                state.subscribed = Some(Subscription {
                    task_id: task_id.to_string(),
                    channel: channel.clone(),
                });
                tracing::info!(
                    session_id = %session_id,
                    channel = %channel,
                    interest = attachment.interest_count,
                    "Session subscribed"
                );
                Ok(channel)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, channel = %channel, error = %e, "Subscribe failed");
                state.reject(task_id, &e);
                Err(e)
            }
        }
    }

    /// Stop following the current channel.
    ///
    /// A `task_id` that does not name the followed task is ignored. Returns
    /// the released channel, or `None` when nothing changed.
    pub async fn on_unsubscribe(
        &self,
        session_id: SessionId,
        task_id: Option<&str>,
    ) -> Option<ChannelName> {
        let session = self.get(session_id).await?;
        let mut state = session.lock().await;

        let current = state.subscribed.as_ref()?;
        if let Some(requested) = task_id {
            if requested != current.task_id {
                tracing::debug!(
                    session_id = %session_id,
                    requested,
                    current = %current.task_id,
                    "Ignoring unsubscribe for a task not followed"
                );
                return None;
            }
        }

        let released = state.subscribed.take()?;
        self.registry.detach(&released.channel, session_id).await;
        state.enqueue(Outbound::Message(ServerMessage::Unsubscribed {
            channel: released.channel.to_string(),
        }));
        tracing::info!(session_id = %session_id, channel = %released.channel, "Session unsubscribed");
        Some(released.channel)
    }

    /// Release everything the session holds. Safe to call more than once.
    ///
    /// Returns `false` when the session was already gone.
    pub async fn on_session_closed(&self, session_id: SessionId) -> bool {
        let Some(session) = self.sessions.write().await.remove(&session_id) else {
            return false;
        };

        let mut state = session.lock().await;
        state.closed = true;
        state.close.cancel();
        if let Some(subscription) = state.subscribed.take() {
            self.registry
                .detach(&subscription.channel, session_id)
                .await;
        }

        tracing::info!(session_id = %session_id, "Session closed");
        true
    }

    /// Tell the client its last control message was not understood.
    pub async fn send_error(&self, session_id: SessionId, message: impl Into<String>) {
        if let Some(session) = self.get(session_id).await {
            session
                .lock()
                .await
                .enqueue(Outbound::Message(ServerMessage::Error {
                    message: message.into(),
                }));
        }
    }

    /// Channel the session currently follows.
    pub async fn subscribed_channel(&self, session_id: SessionId) -> Option<ChannelName> {
        let session = self.get(session_id).await?;
        let state = session.lock().await;
        state.subscribed.as_ref().map(|s| s.channel.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close every session: transports are told to close and all interest
    /// is released.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.on_session_closed(id).await;
        }
        tracing::info!(count, "Closed all sessions");
    }

    async fn get(&self, session_id: SessionId) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.read().await.get(&session_id).cloned()
    }
}

impl SessionState {
    /// Queue a control item without waiting; a full queue drops it.
    fn enqueue(&self, item: Outbound) {
        if let Err(e) = self.sink.try_send(item) {
            tracing::warn!(
                session_id = %self.subscriber.session_id,
                error = %e,
                "Could not queue control message"
            );
        }
    }

    fn reject(&self, task_id: &str, error: &RelayError) {
        self.enqueue(Outbound::Message(ServerMessage::SubscribeFailed {
            task_id: task_id.to_string(),
            error: error.to_string(),
        }));
    }
}

/// Ensures a session is released even when its connection task ends
/// abnormally.
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    session_id: SessionId,
    armed: bool,
}

impl SessionGuard {
    pub fn new(manager: Arc<SessionManager>, session_id: SessionId) -> Self {
        Self {
            manager,
            session_id,
            armed: true,
        }
    }

    /// Release the session now.
    pub async fn close(mut self) {
        self.armed = false;
        self.manager.on_session_closed(self.session_id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let session_id = self.session_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    manager.on_session_closed(session_id).await;
                });
            }
            Err(_) => {
                tracing::error!(session_id = %session_id, "No runtime to release dropped session");
            }
        }
    }
}
