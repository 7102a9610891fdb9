//! Relay Pipeline Integration Tests
//!
//! Exercises the validate -> persist -> fan-out -> notify pipeline through
//! the relay service with live registry receivers, without going through a
//! WebSocket or HTTP ingress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{sleep, timeout};

use confab_relay::auth::AuthPolicy;
use confab_relay::channel_registry::ChannelRegistry;
use confab_relay::error::RelayError;
use confab_relay::fanout::FanoutEngine;
use confab_relay::metrics::RelayMetrics;
use confab_relay::notify::{NotificationSink, NullNotificationSink};
use confab_relay::relay::MessageRelayService;
use confab_relay::session::{ConnectionId, SubjectId};
use confab_relay::store::{ChatMessage, MemoryMessageStore, MessageStore, StoreError};

mod common;

/// Notification sink that always fails.
struct FailingNotificationSink;

#[async_trait]
impl NotificationSink for FailingNotificationSink {
    async fn notify(
        &self,
        _receiver_id: &str,
        _sender_id: &str,
        _body: &str,
        _sender_display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        Err(RelayError::NotificationFailed("push endpoint down".to_string()))
    }
}

/// Notification sink that hangs long enough to expose any synchronous wait.
struct SlowNotificationSink;

#[async_trait]
impl NotificationSink for SlowNotificationSink {
    async fn notify(
        &self,
        _receiver_id: &str,
        _sender_id: &str,
        _body: &str,
        _sender_display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

/// Store that refuses every write.
struct RefusingStore;

impl MessageStore for RefusingStore {
    fn save(
        &self,
        _sender_id: &str,
        _receiver_id: &str,
        _body: &str,
    ) -> Result<ChatMessage, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }

    fn find_between(&self, _a: &str, _b: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    fn find_recent_between(
        &self,
        _a: &str,
        _b: &str,
        _limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    fn find_by_sender(&self, _sender_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    fn find_by_receiver(&self, _receiver_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(Vec::new())
    }

    fn message_count(&self) -> usize {
        0
    }
}

/// Builds a relay service around the given store and notification sink.
fn build_relay(
    policy: AuthPolicy,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn NotificationSink>,
) -> (Arc<MessageRelayService>, Arc<ChannelRegistry>, RelayMetrics) {
    let metrics = RelayMetrics::new();
    let registry = Arc::new(ChannelRegistry::new());
    let fanout = Arc::new(FanoutEngine::new(Arc::clone(&registry), metrics.clone()));
    let relay = Arc::new(MessageRelayService::new(
        store,
        fanout,
        common::create_test_authenticator(policy),
        notifier,
        metrics.clone(),
        1000,
    ));
    (relay, registry, metrics)
}

fn decode(data: &str) -> Value {
    serde_json::from_str(data).unwrap()
}

/// Test: a relayed message arrives on the receiver's registered channel as a
/// full Message frame carrying the persisted id.
#[tokio::test]
async fn test_relay_reaches_registered_receiver() {
    let (relay, store, registry) = common::create_test_relay(AuthPolicy::Reject);
    let mut receiver_rx = registry.register("bob", ConnectionId::new());

    let message = relay
        .relay_from_connection(&SubjectId::new("alice"), "alice", "bob", "hello", None)
        .await
        .unwrap();

    let frame = decode(&receiver_rx.try_recv().unwrap().data);
    assert_eq!(frame["type"], "Message");
    assert_eq!(frame["id"].as_str(), Some(message.id.as_str()));
    assert_eq!(frame["senderId"], "alice");
    assert_eq!(frame["message"], "hello");
    assert_eq!(store.message_count(), 1);
}

/// Test: the full destination set reaches receiver, sender, conversation
/// topic, and subject topic subscribers, one copy each.
#[tokio::test]
async fn test_full_destination_set_with_everyone_online() {
    let (relay, _store, registry) = common::create_test_relay(AuthPolicy::Reject);

    let conn_alice = ConnectionId::new();
    let conn_bob = ConnectionId::new();
    let conn_carol = ConnectionId::new();
    let conn_dave = ConnectionId::new();
    let mut alice_rx = registry.register("alice", conn_alice);
    let mut bob_rx = registry.register("bob", conn_bob);
    let mut carol_rx = registry.register("carol", conn_carol);
    let mut dave_rx = registry.register("dave", conn_dave);
    registry.subscribe("alice_bob", conn_carol);
    registry.subscribe("bob", conn_dave);

    let message = relay
        .relay_from_connection(&SubjectId::new("alice"), "alice", "bob", "hello", None)
        .await
        .unwrap();

    for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx, &mut dave_rx] {
        let frame = decode(&rx.try_recv().unwrap().data);
        assert_eq!(frame["id"].as_str(), Some(message.id.as_str()));
        assert!(rx.try_recv().is_err(), "each connection gets exactly one copy");
    }
}

/// Test: a connection subscribed to an overlapping destination receives the
/// message twice; the relay never deduplicates.
#[tokio::test]
async fn test_overlapping_subscriptions_deliver_duplicates() {
    let (relay, _store, registry) = common::create_test_relay(AuthPolicy::Reject);

    let conn_bob = ConnectionId::new();
    let mut bob_rx = registry.register("bob", conn_bob);
    registry.subscribe("alice_bob", conn_bob);

    relay
        .relay_from_connection(&SubjectId::new("alice"), "alice", "bob", "twice", None)
        .await
        .unwrap();

    let first = decode(&bob_rx.try_recv().unwrap().data);
    let second = decode(&bob_rx.try_recv().unwrap().data);
    assert_eq!(first["id"], second["id"]);
    assert!(bob_rx.try_recv().is_err());
}

/// Test: a failing push sink never fails the relay call; the failure is
/// only counted.
#[tokio::test]
async fn test_notification_failure_never_fails_the_relay() {
    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let (relay, _registry, metrics) = build_relay(
        AuthPolicy::Reject,
        Arc::clone(&store),
        Arc::new(FailingNotificationSink),
    );

    let result = relay
        .relay_synchronous(&SubjectId::new("alice"), "alice", "bob", "hello", None)
        .await;

    assert!(result.is_ok());
    assert_eq!(store.message_count(), 1);

    // The push task runs detached; give it a moment to record the failure.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.notifications_failed.get(), 1);
    assert_eq!(metrics.notifications_sent.get(), 0);
}

/// Test: the relay returns before the push completes; the sink is
/// fire-and-forget.
#[tokio::test]
async fn test_slow_notification_does_not_delay_the_response() {
    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let (relay, _registry, _metrics) =
        build_relay(AuthPolicy::Reject, store, Arc::new(SlowNotificationSink));

    let result = timeout(
        Duration::from_millis(500),
        relay.relay_synchronous(&SubjectId::new("alice"), "alice", "bob", "hello", None),
    )
    .await;

    assert!(result.expect("relay must not wait for the push").is_ok());
}

/// Test: a store failure surfaces as PERSISTENCE_FAILED and nothing is
/// delivered downstream.
#[tokio::test]
async fn test_persistence_failure_surfaces_and_nothing_is_delivered() {
    let (relay, registry, metrics) = build_relay(
        AuthPolicy::Reject,
        Arc::new(RefusingStore),
        Arc::new(NullNotificationSink),
    );
    let mut receiver_rx = registry.register("bob", ConnectionId::new());

    let result = relay
        .relay_synchronous(&SubjectId::new("alice"), "alice", "bob", "hello", None)
        .await;

    assert!(matches!(result, Err(RelayError::PersistenceFailed(_))));
    assert!(receiver_rx.try_recv().is_err());
    assert_eq!(metrics.persistence_failures.get(), 1);
    assert_eq!(metrics.messages_relayed.get(), 0);
}

/// Test: relayed messages come back from the history queries in
/// chronological order, trimmed, and symmetric for both participants.
#[tokio::test]
async fn test_relayed_conversation_is_queryable_in_order() {
    let (relay, store, _registry) = common::create_test_relay(AuthPolicy::AllowAnonymous);
    let alice = SubjectId::new("alice");
    let bob = SubjectId::new("bob");

    relay
        .relay_from_connection(&alice, "alice", "bob", "  first  ", None)
        .await
        .unwrap();
    relay
        .relay_from_connection(&bob, "bob", "alice", "second", None)
        .await
        .unwrap();
    relay
        .relay_from_connection(&alice, "alice", "bob", "third", None)
        .await
        .unwrap();

    let history = store.find_between("alice", "bob").unwrap();
    let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);

    let reversed = store.find_between("bob", "alice").unwrap();
    assert_eq!(history, reversed);

    let recent = store.find_recent_between("alice", "bob", 2).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].body, "third");
    assert_eq!(recent[1].body, "second");
}

/// Test: relay outcomes are visible in the pipeline counters.
#[tokio::test]
async fn test_relay_metrics_track_outcomes() {
    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let (relay, _registry, metrics) = build_relay(
        AuthPolicy::Reject,
        store,
        Arc::new(NullNotificationSink),
    );
    let alice = SubjectId::new("alice");

    relay
        .relay_synchronous(&alice, "alice", "bob", "counted", None)
        .await
        .unwrap();
    let _ = relay.relay_synchronous(&alice, "alice", "bob", "   ", None).await;
    let _ = relay
        .relay_synchronous(&alice, "bob", "carol", "spoofed", None)
        .await;

    assert_eq!(metrics.messages_relayed.get(), 1);
    assert_eq!(metrics.messages_rejected.get(), 2);
    assert_eq!(metrics.persistence_failures.get(), 0);
}

/// Test: an anonymous session can relay under the permissive policy and is
/// refused under the strict one.
#[tokio::test]
async fn test_anonymous_sender_per_policy() {
    let anon = SubjectId::anonymous();

    let (relay, store, _registry) = common::create_test_relay(AuthPolicy::AllowAnonymous);
    let allowed = relay
        .relay_from_connection(&anon, "ghost", "bob", "boo", None)
        .await;
    assert!(allowed.is_ok());
    assert_eq!(store.message_count(), 1);

    let (relay, store, _registry) = common::create_test_relay(AuthPolicy::Reject);
    let refused = relay
        .relay_from_connection(&anon, "ghost", "bob", "boo", None)
        .await;
    assert!(matches!(refused, Err(RelayError::AuthRejected(_))));
    assert_eq!(store.message_count(), 0);
}
