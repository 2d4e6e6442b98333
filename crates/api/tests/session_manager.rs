//! Tests for the session manager driven directly, without sockets.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use taskrelay_core::channels::ChannelName;
use taskrelay_core::event::TaskEvent;
use taskrelay_core::messages::ServerMessage;
use taskrelay_events::{Broker, Outbound, RelayError};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn channel(task_id: &str) -> ChannelName {
    ChannelName::for_task("product_analysis", task_id).unwrap()
}

async fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound item")
        .expect("session queue closed")
}

async fn publish(app: &common::TestApp, task_id: &str, message: &str) {
    let payload = serde_json::to_string(&TaskEvent::new("Scraper", message)).unwrap();
    app.broker.publish(&channel(task_id), payload).await.unwrap();
}

fn event_message(item: Outbound) -> String {
    match item {
        Outbound::Event { event, .. } => event.message.clone(),
        other => panic!("expected event, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Subscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_acknowledges_before_events() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;

    let subscribed = sessions.on_subscribe(handle.id, "T1").await.unwrap();
    assert_eq!(subscribed, channel("T1"));
    assert_matches!(next(&mut handle.outbound).await, Outbound::Subscribed(c) if c == channel("T1"));

    publish(&app, "T1", "first").await;
    assert_eq!(event_message(next(&mut handle.outbound).await), "first");
    assert_eq!(sessions.subscribed_channel(handle.id).await, Some(channel("T1")));
}

#[tokio::test]
async fn switching_task_releases_previous_channel() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let registry = &app.state.registry;
    let mut handle = sessions.open().await;

    sessions.on_subscribe(handle.id, "A").await.unwrap();
    next(&mut handle.outbound).await;
    sessions.on_subscribe(handle.id, "B").await.unwrap();
    assert_matches!(next(&mut handle.outbound).await, Outbound::Subscribed(c) if c == channel("B"));

    assert_eq!(registry.interest_count(&channel("A")).await, None);
    assert_eq!(registry.interest_count(&channel("B")).await, Some(1));
    assert_eq!(app.broker.live_subscriptions(&channel("A")).await, 0);

    publish(&app, "A", "stale").await;
    publish(&app, "B", "fresh").await;
    assert_eq!(event_message(next(&mut handle.outbound).await), "fresh");
}

#[tokio::test]
async fn resubscribing_same_task_keeps_interest() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;

    sessions.on_subscribe(handle.id, "T1").await.unwrap();
    next(&mut handle.outbound).await;
    sessions.on_subscribe(handle.id, "T1").await.unwrap();

    assert_matches!(next(&mut handle.outbound).await, Outbound::Subscribed(c) if c == channel("T1"));
    assert_eq!(app.state.registry.interest_count(&channel("T1")).await, Some(1));
    assert_eq!(app.broker.subscribe_count(), 1);
}

#[tokio::test]
async fn invalid_task_id_is_rejected_to_client() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;

    let result = sessions.on_subscribe(handle.id, "bad id!").await;
    assert_matches!(result, Err(RelayError::InvalidTask(_)));
    assert_matches!(
        next(&mut handle.outbound).await,
        Outbound::Message(ServerMessage::SubscribeFailed { task_id, .. }) if task_id == "bad id!"
    );
    assert_eq!(app.state.registry.active_channels().await, 0);
}

#[tokio::test]
async fn broker_outage_reports_subscribe_failed() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;
    app.broker.set_available(false);

    let result = sessions.on_subscribe(handle.id, "T1").await;
    assert_matches!(result, Err(RelayError::ChannelUnavailable { .. }));
    assert_matches!(
        next(&mut handle.outbound).await,
        Outbound::Message(ServerMessage::SubscribeFailed { .. })
    );
    assert_eq!(app.state.registry.active_channels().await, 0);
    assert_eq!(sessions.subscribed_channel(handle.id).await, None);

    app.broker.set_available(true);
    sessions.on_subscribe(handle.id, "T1").await.unwrap();
    assert_matches!(next(&mut handle.outbound).await, Outbound::Subscribed(_));
}

// ---------------------------------------------------------------------------
// Unsubscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsubscribe_releases_and_acknowledges() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;

    sessions.on_subscribe(handle.id, "T1").await.unwrap();
    next(&mut handle.outbound).await;

    let released = sessions.on_unsubscribe(handle.id, Some("T1")).await;
    assert_eq!(released, Some(channel("T1")));
    assert_matches!(
        next(&mut handle.outbound).await,
        Outbound::Message(ServerMessage::Unsubscribed { channel }) if channel == "product_analysis_T1"
    );
    assert_eq!(app.state.registry.interest_count(&channel("T1")).await, None);
}

#[tokio::test]
async fn unsubscribe_for_other_task_is_ignored() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let mut handle = sessions.open().await;

    sessions.on_subscribe(handle.id, "T1").await.unwrap();
    next(&mut handle.outbound).await;

    assert_eq!(sessions.on_unsubscribe(handle.id, Some("T2")).await, None);
    assert_eq!(sessions.subscribed_channel(handle.id).await, Some(channel("T1")));
    assert_eq!(app.state.registry.interest_count(&channel("T1")).await, Some(1));
}

#[tokio::test]
async fn unsubscribe_without_subscription_is_noop() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let handle = sessions.open().await;

    assert_eq!(sessions.on_unsubscribe(handle.id, None).await, None);
}

// ---------------------------------------------------------------------------
// Session close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closing_session_releases_interest() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let handle = sessions.open().await;

    sessions.on_subscribe(handle.id, "T1").await.unwrap();
    assert!(sessions.on_session_closed(handle.id).await);
    assert!(!sessions.on_session_closed(handle.id).await);

    assert!(handle.close.is_cancelled());
    assert_eq!(sessions.session_count().await, 0);
    assert_eq!(app.state.registry.active_channels().await, 0);
    assert_eq!(app.broker.total_live_subscriptions().await, 0);
}

#[tokio::test]
async fn subscribe_after_close_is_refused() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let handle = sessions.open().await;
    sessions.on_session_closed(handle.id).await;

    let result = sessions.on_subscribe(handle.id, "T1").await;
    assert_matches!(result, Err(RelayError::UnknownSession(id)) if id == handle.id);
    assert_eq!(app.state.registry.active_channels().await, 0);
}

#[tokio::test]
async fn two_sessions_share_one_upstream_until_both_leave() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let registry = &app.state.registry;
    let mut first = sessions.open().await;
    let mut second = sessions.open().await;

    sessions.on_subscribe(first.id, "T2").await.unwrap();
    sessions.on_subscribe(second.id, "T2").await.unwrap();
    next(&mut first.outbound).await;
    next(&mut second.outbound).await;
    assert_eq!(registry.interest_count(&channel("T2")).await, Some(2));
    assert_eq!(app.broker.live_subscriptions(&channel("T2")).await, 1);

    sessions.on_session_closed(first.id).await;
    assert_eq!(registry.interest_count(&channel("T2")).await, Some(1));

    publish(&app, "T2", "still here").await;
    assert_eq!(event_message(next(&mut second.outbound).await), "still here");

    sessions.on_session_closed(second.id).await;
    assert_eq!(registry.interest_count(&channel("T2")).await, None);
    assert_eq!(app.broker.live_subscriptions(&channel("T2")).await, 0);
}

#[tokio::test]
async fn shutdown_all_closes_every_session() {
    let app = common::build_test_app();
    let sessions = &app.state.sessions;
    let a = sessions.open().await;
    let b = sessions.open().await;
    sessions.on_subscribe(a.id, "A").await.unwrap();
    sessions.on_subscribe(b.id, "B").await.unwrap();

    sessions.shutdown_all().await;

    assert!(a.close.is_cancelled());
    assert!(b.close.is_cancelled());
    assert_eq!(sessions.session_count().await, 0);
    assert_eq!(app.state.registry.active_channels().await, 0);
}
