//! Reference-counted registry of live task channels.
//!
//! [`ChannelRegistry`] maps each [`ChannelName`] to one upstream broker
//! subscription plus the set of sessions interested in it. It is an
//! explicit object injected into the session layer (usually behind an
//! `Arc`), so tests can run several independent registries side by side.
//!
//! # Locking
//!
//! Every mutation of a channel (attach, detach, entry creation and
//! teardown) runs under that channel's own slot lock. The table lock is
//! only held for short lookups, never across broker I/O, so unrelated
//! channels never wait on each other.
//!
//! Lock order is `slot -> table`: detach may touch the table while holding
//! a slot lock, attach never waits on a slot lock while holding the table.
//!
//! # Delivery
//!
//! Fan-out uses `try_send` into each session's bounded queue. A full queue
//! drops the event for that session only; after
//! [`RegistryConfig::max_consecutive_drops`] consecutive drops the session
//! is force-closed through its cancellation token. A session whose queue
//! is already closed is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskrelay_core::channels::ChannelName;
use taskrelay_core::event::TaskEvent;
use taskrelay_core::messages::ServerMessage;
use taskrelay_core::types::SessionId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::adapter::{self, UpstreamHandle};
use crate::broker::Broker;
use crate::error::RelayError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for the registry and the adapters it spawns.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of the queue between an upstream reader and its dispatcher.
    pub upstream_queue_capacity: usize,
    /// Consecutive dropped events after which a slow session is closed.
    pub max_consecutive_drops: u32,
    /// Bound on opening and on closing an upstream subscription.
    pub broker_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            upstream_queue_capacity: 128,
            max_consecutive_drops: 64,
            broker_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Session-facing types
// ---------------------------------------------------------------------------

/// Item queued for one session's transport.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Interest in the channel became live. Always queued before any event
    /// of that channel reaches the same session.
    Subscribed(ChannelName),
    /// An event fanned out from a channel.
    Event {
        channel: ChannelName,
        event: Arc<TaskEvent>,
    },
    /// A control message produced by the session layer.
    Message(ServerMessage),
}

/// Sending half of a session's outbound queue.
pub type SessionSink = mpsc::Sender<Outbound>;

/// A session's delivery endpoint, handed to the registry on attach.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub session_id: SessionId,
    sink: SessionSink,
    close: CancellationToken,
}

impl Subscriber {
    /// `close` is cancelled by the registry to force-close a session that
    /// cannot keep up.
    pub fn new(session_id: SessionId, sink: SessionSink, close: CancellationToken) -> Self {
        Self {
            session_id,
            sink,
            close,
        }
    }
}

/// Result of a successful [`ChannelRegistry::attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub channel: ChannelName,
    /// Interest count right after this attach.
    pub interest_count: usize,
    /// Whether this call opened the upstream subscription.
    pub created: bool,
}

/// Result of [`ChannelRegistry::detach`]. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Interest released, others remain.
    Released { remaining: usize },
    /// Last interest released; the upstream subscription was closed.
    Closed,
    /// No entry for the channel, or the session was not attached to it.
    NotFound,
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    sink: SessionSink,
    close: CancellationToken,
    consecutive_drops: AtomicU32,
}

/// Sessions currently receiving one channel's events.
pub(crate) struct FanOut {
    channel: ChannelName,
    subscribers: RwLock<HashMap<SessionId, SubscriberSlot>>,
    max_consecutive_drops: u32,
}

impl FanOut {
    fn new(channel: ChannelName, max_consecutive_drops: u32) -> Self {
        Self {
            channel,
            subscribers: RwLock::new(HashMap::new()),
            max_consecutive_drops: max_consecutive_drops.max(1),
        }
    }

    /// Deliver `event` to every current subscriber. Returns how many
    /// sessions accepted it.
    pub(crate) async fn dispatch(&self, event: Arc<TaskEvent>) -> usize {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;

        for (session_id, slot) in subscribers.iter() {
            let item = Outbound::Event {
                channel: self.channel.clone(),
                event: Arc::clone(&event),
            };
            match slot.sink.try_send(item) {
                Ok(()) => {
                    slot.consecutive_drops.store(0, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    let drops = slot.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops >= self.max_consecutive_drops {
                        tracing::warn!(
                            channel = %self.channel,
                            session_id = %session_id,
                            drops,
                            "Force-closing slow session"
                        );
                        slot.close.cancel();
                    } else {
                        tracing::warn!(
                            channel = %self.channel,
                            session_id = %session_id,
                            drops,
                            "Session queue full, event dropped"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        channel = %self.channel,
                        session_id = %session_id,
                        "Session closed mid fan-out, skipping"
                    );
                }
            }
        }

        tracing::trace!(channel = %self.channel, delivered, "Event fanned out");
        delivered
    }

    async fn clear(&self) {
        self.subscribers.write().await.clear();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

enum SlotState {
    /// Freshly inserted; the first attacher is opening the upstream.
    Vacant,
    Live(ChannelEntry),
    /// Torn down and removed (or being removed) from the table.
    Retired,
}

struct ChannelEntry {
    interest_count: usize,
    upstream: UpstreamHandle,
}

struct ChannelSlot {
    fanout: Arc<FanOut>,
    state: Mutex<SlotState>,
}

type SlotTable = Mutex<HashMap<ChannelName, Arc<ChannelSlot>>>;

/// Retires a slot whose creating attach was dropped while the upstream
/// was still opening, so the table never keeps an ownerless `Vacant` slot.
struct VacantSlotGuard {
    table: Arc<SlotTable>,
    channel: ChannelName,
    slot: Arc<ChannelSlot>,
    armed: bool,
}

impl VacantSlotGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for VacantSlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = Arc::clone(&self.table);
        let channel = self.channel.clone();
        let slot = Arc::clone(&self.slot);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let mut state = slot.state.lock().await;
            if !matches!(*state, SlotState::Vacant) {
                return;
            }
            *state = SlotState::Retired;
            let mut table = table.lock().await;
            if table
                .get(&channel)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                table.remove(&channel);
            }
            tracing::debug!(channel = %channel, "Removed slot abandoned while opening");
        });
    }
}

/// Process-wide table of live task channels.
pub struct ChannelRegistry {
    broker: Arc<dyn Broker>,
    config: RegistryConfig,
    slots: Arc<SlotTable>,
    shutdown: CancellationToken,
}

impl ChannelRegistry {
    pub fn new(broker: Arc<dyn Broker>, config: RegistryConfig) -> Self {
        Self {
            broker,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register `subscriber`'s interest in `channel`.
    ///
    /// The first attach opens the upstream subscription; later attaches
    /// only increment the interest count. Attaching a session that is
    /// already attached to the channel changes nothing.
    ///
    /// On success an [`Outbound::Subscribed`] marker has been queued to the
    /// subscriber ahead of any event of the channel.
    pub async fn attach(
        &self,
        channel: &ChannelName,
        subscriber: Subscriber,
    ) -> Result<Attachment, RelayError> {
        // Reserve room for the join marker up front so a full queue fails
        // before any registry state changes.
        let permit = subscriber
            .sink
            .try_reserve()
            .map_err(|_| RelayError::SessionBackpressure(subscriber.session_id))?;

        loop {
            let slot = self.slot_for(channel).await?;
            let mut state = slot.state.lock().await;

            if matches!(*state, SlotState::Retired) {
                continue;
            }

            let created = matches!(*state, SlotState::Vacant);
            if created {
                let guard = VacantSlotGuard {
                    table: Arc::clone(&self.slots),
                    channel: channel.clone(),
                    slot: Arc::clone(&slot),
                    armed: true,
                };
                let opened = self.open_upstream(channel, &slot.fanout).await;
                guard.disarm();
                match opened {
                    Ok(upstream) => {
                        *state = SlotState::Live(ChannelEntry {
                            interest_count: 0,
                            upstream,
                        });
                    }
                    Err(e) => {
                        *state = SlotState::Retired;
                        self.remove_slot(channel, &slot).await;
                        tracing::warn!(channel = %channel, error = %e, "Failed to open upstream subscription");
                        return Err(e);
                    }
                }
            }

            let SlotState::Live(entry) = &mut *state else {
                continue;
            };

            let mut subscribers = slot.fanout.subscribers.write().await;
            if subscribers.contains_key(&subscriber.session_id) {
                return Ok(Attachment {
                    channel: channel.clone(),
                    interest_count: entry.interest_count,
                    created: false,
                });
            }

            subscribers.insert(
                subscriber.session_id,
                SubscriberSlot {
                    sink: subscriber.sink.clone(),
                    close: subscriber.close.clone(),
                    consecutive_drops: AtomicU32::new(0),
                },
            );
            permit.send(Outbound::Subscribed(channel.clone()));
            entry.interest_count += 1;

            if created {
                tracing::info!(channel = %channel, session_id = %subscriber.session_id, "Opened upstream subscription");
            } else {
                tracing::debug!(
                    channel = %channel,
                    session_id = %subscriber.session_id,
                    interest = entry.interest_count,
                    "Interest added"
                );
            }

            return Ok(Attachment {
                channel: channel.clone(),
                interest_count: entry.interest_count,
                created,
            });
        }
    }

    /// Release `session_id`'s interest in `channel`.
    ///
    /// When the count reaches zero the upstream subscription is closed and
    /// the entry removed before this returns. Unknown channels and sessions
    /// yield [`DetachOutcome::NotFound`], which callers treat as success.
    pub async fn detach(&self, channel: &ChannelName, session_id: SessionId) -> DetachOutcome {
        let Some(slot) = self.slots.lock().await.get(channel).cloned() else {
            return DetachOutcome::NotFound;
        };
        let mut state = slot.state.lock().await;

        let remaining = {
            let SlotState::Live(entry) = &mut *state else {
                return DetachOutcome::NotFound;
            };
            if slot
                .fanout
                .subscribers
                .write()
                .await
                .remove(&session_id)
                .is_none()
            {
                return DetachOutcome::NotFound;
            }
            entry.interest_count -= 1;
            entry.interest_count
        };

        if remaining > 0 {
            tracing::debug!(channel = %channel, session_id = %session_id, remaining, "Interest released");
            return DetachOutcome::Released { remaining };
        }

        // Close before the slot leaves the table: attachers queued on this
        // slot retry only once the old subscription is gone.
        if let SlotState::Live(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
            entry.upstream.close(self.config.broker_timeout).await;
        }
        self.remove_slot(channel, &slot).await;

        tracing::info!(channel = %channel, "Closed upstream subscription, no interest left");
        DetachOutcome::Closed
    }

    /// Fan `event` out to every session attached to `channel`.
    ///
    /// Returns the number of sessions that accepted it; zero when the
    /// channel has no entry.
    pub async fn publish(&self, channel: &ChannelName, event: TaskEvent) -> usize {
        let fanout = self
            .slots
            .lock()
            .await
            .get(channel)
            .map(|slot| Arc::clone(&slot.fanout));

        match fanout {
            Some(fanout) => fanout.dispatch(Arc::new(event)).await,
            None => 0,
        }
    }

    /// Interest count of `channel`, or `None` when it has no entry.
    pub async fn interest_count(&self, channel: &ChannelName) -> Option<usize> {
        let slot = self.slots.lock().await.get(channel).cloned()?;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Live(entry) => Some(entry.interest_count),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }

    /// Number of table entries, counting channels still being opened.
    pub async fn tracked_channels(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Number of channels with a live upstream subscription.
    pub async fn active_channels(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if matches!(&*slot.state.lock().await, SlotState::Live(_)) {
                live += 1;
            }
        }
        live
    }

    /// Close every upstream subscription and refuse further attaches.
    ///
    /// Returns the number of channels that were torn down.
    pub async fn shutdown(&self) -> usize {
        let slots: Vec<_> = {
            let mut table = self.slots.lock().await;
            self.shutdown.cancel();
            table.drain().collect()
        };

        let mut closed = 0;
        for (channel, slot) in slots {
            let mut state = slot.state.lock().await;
            if let SlotState::Live(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
                slot.fanout.clear().await;
                entry.upstream.close(self.config.broker_timeout).await;
                tracing::info!(channel = %channel, interest = entry.interest_count, "Closed upstream subscription on shutdown");
                closed += 1;
            }
        }

        tracing::info!(closed, "Channel registry shut down");
        closed
    }

    // ---- private helpers ----

    /// Fetch the slot for `channel`, inserting a vacant one if needed.
    async fn slot_for(&self, channel: &ChannelName) -> Result<Arc<ChannelSlot>, RelayError> {
        let mut table = self.slots.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ShuttingDown);
        }
        let slot = table.entry(channel.clone()).or_insert_with(|| {
            Arc::new(ChannelSlot {
                fanout: Arc::new(FanOut::new(
                    channel.clone(),
                    self.config.max_consecutive_drops,
                )),
                state: Mutex::new(SlotState::Vacant),
            })
        });
        Ok(Arc::clone(slot))
    }

    /// Remove `slot` from the table if it is still the registered one.
    async fn remove_slot(&self, channel: &ChannelName, slot: &Arc<ChannelSlot>) {
        let mut table = self.slots.lock().await;
        if table
            .get(channel)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            table.remove(channel);
        }
    }

    async fn open_upstream(
        &self,
        channel: &ChannelName,
        fanout: &Arc<FanOut>,
    ) -> Result<UpstreamHandle, RelayError> {
        let subscription =
            match tokio::time::timeout(self.config.broker_timeout, self.broker.subscribe(channel))
                .await
            {
                Ok(Ok(subscription)) => subscription,
                Ok(Err(e)) => {
                    return Err(RelayError::ChannelUnavailable {
                        channel: channel.to_string(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(RelayError::ChannelUnavailable {
                        channel: channel.to_string(),
                        reason: "timed out opening upstream subscription".into(),
                    })
                }
            };

        Ok(adapter::spawn(
            subscription,
            Arc::clone(fanout),
            self.config.upstream_queue_capacity,
            &self.shutdown,
        ))
    }
}
