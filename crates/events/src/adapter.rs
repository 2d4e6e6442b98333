//! Upstream adapter: one broker subscription feeding one channel's fan-out.
//!
//! Each live channel runs two tasks:
//!
//! - a **reader** that pulls raw payloads from the broker, decodes them into
//!   [`TaskEvent`]s and pushes them onto a bounded queue;
//! - a **dispatcher** that drains the queue into the channel's fan-out.
//!
//! Malformed payloads are logged and dropped; the subscription stays up.
//! Cancelling the handle stops the reader, which releases the broker
//! subscription and closes the queue, after which the dispatcher drains
//! what is left and exits.

use std::sync::Arc;
use std::time::Duration;

use taskrelay_core::channels::ChannelName;
use taskrelay_core::event::TaskEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::UpstreamSubscription;
use crate::error::RelayError;
use crate::registry::FanOut;

/// Running reader/dispatcher pair for one channel.
pub(crate) struct UpstreamHandle {
    channel: ChannelName,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Stop both tasks and wait for the broker subscription to be released.
    ///
    /// Each task gets `timeout` to finish before it is aborted.
    pub(crate) async fn close(self, timeout: Duration) {
        self.cancel.cancel();

        for (name, mut handle) in [("reader", self.reader), ("dispatcher", self.dispatcher)] {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(channel = %self.channel, task = name, error = %e, "Upstream task failed");
                }
                Err(_) => {
                    tracing::warn!(channel = %self.channel, task = name, "Upstream task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Start the reader and dispatcher for `subscription`.
///
/// The tasks stop when the handle is closed or when `parent` is cancelled.
pub(crate) fn spawn(
    subscription: Box<dyn UpstreamSubscription>,
    fanout: Arc<FanOut>,
    queue_capacity: usize,
    parent: &CancellationToken,
) -> UpstreamHandle {
    let channel = subscription.channel().clone();
    let cancel = parent.child_token();
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));

    let reader = tokio::spawn(read_upstream(subscription, tx, cancel.clone()));
    let dispatcher = tokio::spawn(dispatch_events(channel.clone(), rx, fanout));

    UpstreamHandle {
        channel,
        cancel,
        reader,
        dispatcher,
    }
}

/// Decode one raw broker payload.
pub fn decode_event(channel: &ChannelName, payload: &str) -> Result<TaskEvent, RelayError> {
    let event: TaskEvent =
        serde_json::from_str(payload).map_err(|e| RelayError::MalformedEvent {
            channel: channel.to_string(),
            reason: e.to_string(),
        })?;

    if event.is_blank() {
        return Err(RelayError::MalformedEvent {
            channel: channel.to_string(),
            reason: "event carries no agent, message or status".into(),
        });
    }
    Ok(event)
}

async fn read_upstream(
    mut subscription: Box<dyn UpstreamSubscription>,
    queue: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
) {
    let channel = subscription.channel().clone();
    tracing::debug!(channel = %channel, "Upstream reader started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = subscription.recv() => payload,
        };

        let Some(payload) = payload else {
            tracing::warn!(channel = %channel, "Upstream subscription ended by broker");
            break;
        };

        let event = match decode_event(&channel, &payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Dropping malformed upstream event");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = queue.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    subscription.close().await;
    tracing::debug!(channel = %channel, "Upstream reader stopped");
}

async fn dispatch_events(
    channel: ChannelName,
    mut queue: mpsc::Receiver<TaskEvent>,
    fanout: Arc<FanOut>,
) {
    let mut forwarded: u64 = 0;
    while let Some(event) = queue.recv().await {
        fanout.dispatch(Arc::new(event)).await;
        forwarded += 1;
    }
    tracing::debug!(channel = %channel, forwarded, "Upstream dispatcher stopped");
}
