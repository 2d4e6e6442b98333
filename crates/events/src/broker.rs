//! Upstream publish/subscribe broker boundary.
//!
//! [`Broker`] is what the relay needs from the external broker: open one
//! subscription per channel and publish raw payloads. [`InMemoryBroker`]
//! implements it in-process on top of `tokio::sync::broadcast`, one sender
//! per channel, and is shared via cheap clones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::channels::ChannelName;
use tokio::sync::{broadcast, RwLock};

/// Default buffer capacity of each per-channel broadcast sender.
const DEFAULT_CAPACITY: usize = 1024;

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or refused the operation.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Boundary to the external publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new subscription on `channel`.
    async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> Result<Box<dyn UpstreamSubscription>, BrokerError>;

    /// Publish a raw payload. Returns the number of live subscriptions that
    /// received it; zero subscribers is not an error.
    async fn publish(&self, channel: &ChannelName, payload: String) -> Result<usize, BrokerError>;
}

/// One open subscription on the broker.
#[async_trait]
pub trait UpstreamSubscription: Send {
    fn channel(&self) -> &ChannelName;

    /// Next raw payload, or `None` once the broker side has gone away.
    async fn recv(&mut self) -> Option<String>;

    /// Release the subscription with the broker. Idempotent.
    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// In-process broker.
///
/// When a channel's buffer is full the oldest payloads are dropped and the
/// lagging subscription logs how many it missed.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    channels: RwLock<HashMap<ChannelName, broadcast::Sender<String>>>,
    capacity: usize,
    available: AtomicBool,
    subscribe_calls: AtomicUsize,
}

impl InMemoryBroker {
    /// Create a broker whose channels buffer `capacity` payloads each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: RwLock::new(HashMap::new()),
                capacity,
                available: AtomicBool::new(true),
                subscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Total number of successful `subscribe` calls since creation.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions currently open on `channel`.
    pub async fn live_subscriptions(&self, channel: &ChannelName) -> usize {
        self.inner
            .channels
            .read()
            .await
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of subscriptions currently open across all channels.
    pub async fn total_live_subscriptions(&self) -> usize {
        self.inner
            .channels
            .read()
            .await
            .values()
            .map(broadcast::Sender::receiver_count)
            .sum()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> Result<Box<dyn UpstreamSubscription>, BrokerError> {
        self.check_available()?;

        let receiver = {
            let mut channels = self.inner.channels.write().await;
            channels
                .entry(channel.clone())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(channel = %channel, "In-memory subscription opened");

        Ok(Box::new(InMemorySubscription {
            channel: channel.clone(),
            receiver: Some(receiver),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn publish(&self, channel: &ChannelName, payload: String) -> Result<usize, BrokerError> {
        self.check_available()?;

        let channels = self.inner.channels.read().await;
        match channels.get(channel) {
            // A send error only means there are zero receivers.
            Some(sender) => Ok(sender.send(payload).unwrap_or(0)),
            None => Ok(0),
        }
    }
}

struct InMemorySubscription {
    channel: ChannelName,
    receiver: Option<broadcast::Receiver<String>>,
    inner: Arc<Inner>,
}

#[async_trait]
impl UpstreamSubscription for InMemorySubscription {
    fn channel(&self) -> &ChannelName {
        &self.channel
    }

    async fn recv(&mut self) -> Option<String> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        channel = %self.channel,
                        skipped = n,
                        "Upstream subscription lagged, payloads were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        drop(receiver);

        let mut channels = self.inner.channels.write().await;
        if channels
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&self.channel);
        }
        tracing::debug!(channel = %self.channel, "In-memory subscription closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
