// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Relay Service
//!
//! The shared pipeline behind both ingress paths: validate the payload,
//! persist the message, fan it out, fire the push notification. The
//! connection-based and request/response entry points converge here so a
//! message is delivered identically no matter how it entered the relay.
//!
//! Failure contract: validation and persistence failures surface to the
//! caller; everything downstream of a successful save (fan-out, push
//! notification) is caught, logged, and counted, never surfaced. The
//! user-visible promise is "your message was saved".

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::ConnectionAuthenticator;
use crate::error::RelayError;
use crate::fanout::FanoutEngine;
use crate::metrics::RelayMetrics;
use crate::notify::NotificationSink;
use crate::protocol;
use crate::session::SubjectId;
use crate::store::{ChatMessage, MessageStore};

/// Orchestrates the relay pipeline for chat messages and the lighter
/// no-persistence sub-pipelines for typing and presence signals.
pub struct MessageRelayService {
    store: Arc<dyn MessageStore>,
    fanout: Arc<FanoutEngine>,
    authenticator: Arc<ConnectionAuthenticator>,
    notifier: Arc<dyn NotificationSink>,
    metrics: RelayMetrics,
    max_body_chars: usize,
}

impl MessageRelayService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        fanout: Arc<FanoutEngine>,
        authenticator: Arc<ConnectionAuthenticator>,
        notifier: Arc<dyn NotificationSink>,
        metrics: RelayMetrics,
        max_body_chars: usize,
    ) -> Self {
        MessageRelayService {
            store,
            fanout,
            authenticator,
            notifier,
            metrics,
            max_body_chars,
        }
    }

    /// Relays a chat message arriving on a long-lived connection. `sender`
    /// is the subject bound to that connection; the declared `sender_id`
    /// must pass the per-message authorization check against it.
    pub async fn relay_from_connection(
        &self,
        sender: &SubjectId,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        sender_name: Option<&str>,
    ) -> Result<ChatMessage, RelayError> {
        self.relay(sender, sender_id, receiver_id, body, sender_name)
            .await
    }

    /// Relays a chat message arriving on the request/response ingress and
    /// returns the persisted message to the caller. Fan-out and notification
    /// run as side effects whose failures never change the response.
    pub async fn relay_synchronous(
        &self,
        sender: &SubjectId,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        sender_name: Option<&str>,
    ) -> Result<ChatMessage, RelayError> {
        self.relay(sender, sender_id, receiver_id, body, sender_name)
            .await
    }

    async fn relay(
        &self,
        sender: &SubjectId,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        sender_name: Option<&str>,
    ) -> Result<ChatMessage, RelayError> {
        let timer = self.metrics.relay_duration.start_timer();
        let result = self
            .relay_pipeline(sender, sender_id, receiver_id, body, sender_name)
            .await;
        timer.observe_duration();

        match &result {
            Ok(_) => self.metrics.messages_relayed.inc(),
            Err(RelayError::PersistenceFailed(_)) => self.metrics.persistence_failures.inc(),
            Err(_) => self.metrics.messages_rejected.inc(),
        }
        result
    }

    async fn relay_pipeline(
        &self,
        sender: &SubjectId,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        sender_name: Option<&str>,
    ) -> Result<ChatMessage, RelayError> {
        // Validation first: a partial payload must be rejected as
        // INVALID_PAYLOAD before any policy or storage call sees it.
        let trimmed = self.validate(sender_id, receiver_id, body)?;
        self.authenticator.authorize_sender(sender, sender_id)?;

        // Persistence failure is fatal to the call; nothing was delivered.
        let message = self.store.save(sender_id, receiver_id, &trimmed)?;

        // The message is durable from here on. Fan-out is best-effort,
        // at-most-once per destination; partial failure is only logged.
        let report = self.fanout.dispatch(&message);
        if report.failures() > 0 {
            warn!(
                "fan-out for message {} reached {} connections, {} of {} destinations failed",
                message.id,
                report.receivers_reached(),
                report.failures(),
                report.attempts(),
            );
        } else {
            debug!(
                "fan-out for message {} reached {} connections",
                message.id,
                report.receivers_reached(),
            );
        }

        self.spawn_notification(&message, sender_name);
        Ok(message)
    }

    /// Fires the push notification on its own task so a slow or failing
    /// push endpoint never delays the relay response.
    fn spawn_notification(&self, message: &ChatMessage, sender_name: Option<&str>) {
        let notifier = Arc::clone(&self.notifier);
        let metrics = self.metrics.clone();
        let receiver_id = message.receiver_id.clone();
        let sender_id = message.sender_id.clone();
        let body = message.body.clone();
        let sender_name = sender_name.map(|s| s.to_string());

        tokio::spawn(async move {
            match notifier
                .notify(&receiver_id, &sender_id, &body, sender_name.as_deref())
                .await
            {
                Ok(()) => metrics.notifications_sent.inc(),
                Err(e) => {
                    metrics.notifications_failed.inc();
                    warn!("push notification failed: {}", e);
                }
            }
        });
    }

    /// Relays a typing indicator: no persistence, one best-effort delivery
    /// to the receiver's private channel.
    pub fn relay_typing(
        &self,
        sender: &SubjectId,
        sender_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) -> Result<(), RelayError> {
        if sender_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing sender id"));
        }
        if receiver_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing receiver id"));
        }
        self.authenticator.authorize_sender(sender, sender_id)?;

        self.metrics.typing_events.inc();
        self.fanout.deliver_typing(sender_id, receiver_id, is_typing);
        Ok(())
    }

    /// Publishes a presence/status announcement on the presence topic.
    pub fn publish_status(
        &self,
        sender: &SubjectId,
        user_id: &str,
        status: &str,
    ) -> Result<(), RelayError> {
        if user_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing user id"));
        }
        self.authenticator.authorize_sender(sender, user_id)?;

        self.fanout
            .publish_presence(&protocol::create_presence_status(user_id, status));
        Ok(())
    }

    /// Publishes a join/leave announcement on the presence topic.
    pub fn publish_join(
        &self,
        sender: &SubjectId,
        user_id: &str,
        action: &str,
    ) -> Result<(), RelayError> {
        if user_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing user id"));
        }
        self.authenticator.authorize_sender(sender, user_id)?;

        self.fanout
            .publish_presence(&protocol::create_presence_action(user_id, action));
        Ok(())
    }

    fn validate(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<String, RelayError> {
        if sender_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing sender id"));
        }
        if receiver_id.trim().is_empty() {
            return Err(RelayError::InvalidPayload("missing receiver id"));
        }
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Err(RelayError::InvalidPayload("empty message body"));
        }
        if trimmed.chars().count() > self.max_body_chars {
            return Err(RelayError::InvalidPayload("message body too long"));
        }
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthPolicy, StaticTokenVerifier};
    use crate::channel_registry::ChannelRegistry;
    use crate::notify::NullNotificationSink;
    use crate::store::MemoryMessageStore;

    fn service(policy: AuthPolicy) -> (Arc<MessageRelayService>, Arc<dyn MessageStore>) {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let metrics = RelayMetrics::new();
        let registry = Arc::new(ChannelRegistry::new());
        let fanout = Arc::new(FanoutEngine::new(registry, metrics.clone()));
        let verifier = StaticTokenVerifier::new().with_token("tok", "u1");
        let authenticator = Arc::new(ConnectionAuthenticator::new(Arc::new(verifier), policy));
        let relay = Arc::new(MessageRelayService::new(
            Arc::clone(&store),
            fanout,
            authenticator,
            Arc::new(NullNotificationSink),
            metrics,
            1000,
        ));
        (relay, store)
    }

    #[tokio::test]
    async fn test_relay_persists_and_returns_message() {
        let (relay, store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");

        let message = relay
            .relay_synchronous(&sender, "u1", "u2", "hello", None)
            .await
            .unwrap();

        assert!(!message.id.is_empty());
        assert_eq!(message.sender_id, "u1");
        assert_eq!(message.receiver_id, "u2");
        assert_eq!(message.body, "hello");
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_trims_body_before_saving() {
        let (relay, _store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");

        let message = relay
            .relay_from_connection(&sender, "u1", "u2", "  hello  ", None)
            .await
            .unwrap();
        assert_eq!(message.body, "hello");
    }

    #[tokio::test]
    async fn test_whitespace_body_is_rejected_without_state() {
        let (relay, store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");

        let result = relay
            .relay_synchronous(&sender, "u1", "u2", "   \t  ", None)
            .await;
        assert!(matches!(result, Err(RelayError::InvalidPayload(_))));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_ids_are_rejected_before_authorization() {
        // An empty sender id must read as INVALID_PAYLOAD even under the
        // reject policy, not as a sender mismatch.
        let (relay, store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");

        let no_sender = relay.relay_synchronous(&sender, "", "u2", "hi", None).await;
        assert!(matches!(no_sender, Err(RelayError::InvalidPayload(_))));

        let no_receiver = relay.relay_synchronous(&sender, "u1", "", "hi", None).await;
        assert!(matches!(no_receiver, Err(RelayError::InvalidPayload(_))));

        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let (relay, store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");
        let long_body = "x".repeat(1001);

        let result = relay
            .relay_synchronous(&sender, "u1", "u2", &long_body, None)
            .await;
        assert!(matches!(result, Err(RelayError::InvalidPayload(_))));
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_sender_mismatch_per_policy() {
        let (relay, store) = service(AuthPolicy::Reject);
        let bound = SubjectId::new("u1");

        let rejected = relay
            .relay_from_connection(&bound, "u2", "u3", "spoofed", None)
            .await;
        assert!(matches!(rejected, Err(RelayError::AuthRejected(_))));
        assert_eq!(store.message_count(), 0);

        let (relay, store) = service(AuthPolicy::AllowAnonymous);
        let allowed = relay
            .relay_from_connection(&bound, "u2", "u3", "spoofed", None)
            .await;
        assert!(allowed.is_ok());
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_typing_requires_both_ids() {
        let (relay, _store) = service(AuthPolicy::AllowAnonymous);
        let sender = SubjectId::new("u1");

        assert!(relay.relay_typing(&sender, "u1", "u2", true).is_ok());
        assert!(matches!(
            relay.relay_typing(&sender, "", "u2", true),
            Err(RelayError::InvalidPayload(_))
        ));
        assert!(matches!(
            relay.relay_typing(&sender, "u1", "", false),
            Err(RelayError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_presence_requires_user_id() {
        let (relay, _store) = service(AuthPolicy::Reject);
        let sender = SubjectId::new("u1");

        assert!(relay.publish_status(&sender, "u1", "online").is_ok());
        assert!(matches!(
            relay.publish_status(&sender, "", "online"),
            Err(RelayError::InvalidPayload(_))
        ));
        assert!(relay.publish_join(&sender, "u1", "join").is_ok());
    }
}
