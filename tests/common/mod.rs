// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;

use confab_relay::auth::{AuthPolicy, ConnectionAuthenticator, StaticTokenVerifier};
use confab_relay::channel_registry::ChannelRegistry;
use confab_relay::fanout::FanoutEngine;
use confab_relay::metrics::RelayMetrics;
use confab_relay::notify::NullNotificationSink;
use confab_relay::relay::MessageRelayService;
use confab_relay::store::{MemoryMessageStore, MessageStore};

/// Creates an authenticator with a fixed token table:
/// `alice-token` -> `alice`, `bob-token` -> `bob`, `carol-token` -> `carol`.
#[allow(dead_code)]
pub fn create_test_authenticator(policy: AuthPolicy) -> Arc<ConnectionAuthenticator> {
    let verifier = StaticTokenVerifier::new()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob")
        .with_token("carol-token", "carol");
    Arc::new(ConnectionAuthenticator::new(Arc::new(verifier), policy))
}

/// Creates a relay service over in-memory storage with a no-op push sink.
/// Returns the pieces tests observe: the service, the store, the registry.
#[allow(dead_code)]
pub fn create_test_relay(
    policy: AuthPolicy,
) -> (
    Arc<MessageRelayService>,
    Arc<dyn MessageStore>,
    Arc<ChannelRegistry>,
) {
    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let metrics = RelayMetrics::new();
    let registry = Arc::new(ChannelRegistry::new());
    let fanout = Arc::new(FanoutEngine::new(Arc::clone(&registry), metrics.clone()));
    let relay = Arc::new(MessageRelayService::new(
        Arc::clone(&store),
        fanout,
        create_test_authenticator(policy),
        Arc::new(NullNotificationSink),
        metrics,
        1000,
    ));
    (relay, store, registry)
}

/// Seeds a conversation between two users, alternating direction.
/// Bodies are `msg-0` through `msg-{count-1}` in insertion order.
#[allow(dead_code)]
pub fn seed_conversation(store: &dyn MessageStore, a: &str, b: &str, count: usize) {
    for i in 0..count {
        let (sender, receiver) = if i % 2 == 0 { (a, b) } else { (b, a) };
        store
            .save(sender, receiver, &format!("msg-{}", i))
            .expect("seed message");
    }
}
