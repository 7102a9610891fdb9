// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fan-out Engine
//!
//! Delivers one persisted chat message to its full destination set: the
//! receiver's private channel, the sender's private channel (send
//! confirmation and multi-device sync), the shared conversation topic, and
//! the two per-subject topics. Attempts are independent — a refused
//! destination never blocks or rolls back the others — and the engine never
//! deduplicates: a client subscribed to overlapping destinations receives
//! the same message more than once and dedupes by its id.

use std::sync::Arc;

use tracing::{error, warn};

use crate::channel_registry::{ChannelRegistry, OutboundFrame};
use crate::conversation;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::protocol;
use crate::store::ChatMessage;

/// One delivery target within a dispatch round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// The receiver's private channel.
    ReceiverPrivate(String),
    /// The sender's private channel (confirmation, multi-device sync).
    SenderPrivate(String),
    /// The shared topic named by the canonical conversation key.
    ConversationTopic(String),
    /// A topic named after a single subject id.
    SubjectTopic(String),
}

impl Destination {
    /// Stable label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Destination::ReceiverPrivate(_) => "receiver-private",
            Destination::SenderPrivate(_) => "sender-private",
            Destination::ConversationTopic(_) => "conversation-topic",
            Destination::SubjectTopic(_) => "subject-topic",
        }
    }

    /// The channel or topic name the attempt resolves to.
    pub fn target(&self) -> &str {
        match self {
            Destination::ReceiverPrivate(id)
            | Destination::SenderPrivate(id)
            | Destination::ConversationTopic(id)
            | Destination::SubjectTopic(id) => id,
        }
    }
}

/// Result of one delivery attempt. `Ok` carries the number of connections
/// the frame was queued for; zero connections is still a success.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub destination: Destination,
    pub result: Result<usize, RelayError>,
}

/// Per-destination record of one dispatch round, kept for observability.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl DispatchReport {
    /// Delivery attempts made in this round.
    pub fn attempts(&self) -> usize {
        self.outcomes.len()
    }

    /// Distinct destination kinds attempted.
    pub fn logical_kinds(&self) -> usize {
        let mut kinds: Vec<&str> = self.outcomes.iter().map(|o| o.destination.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        kinds.len()
    }

    /// Attempts that failed.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// Total connections the message was queued for across all clean
    /// destinations.
    pub fn receivers_reached(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }
}

/// Computes and dispatches the delivery set for persisted messages, plus
/// the single-destination paths for typing and presence signals.
pub struct FanoutEngine {
    registry: Arc<ChannelRegistry>,
    metrics: RelayMetrics,
}

impl FanoutEngine {
    pub fn new(registry: Arc<ChannelRegistry>, metrics: RelayMetrics) -> Self {
        FanoutEngine { registry, metrics }
    }

    /// The fixed destination set for one message. Self-chat (sender equals
    /// receiver) keeps every duplicate entry.
    fn destinations(message: &ChatMessage) -> Vec<Destination> {
        vec![
            Destination::ReceiverPrivate(message.receiver_id.clone()),
            Destination::SenderPrivate(message.sender_id.clone()),
            Destination::ConversationTopic(conversation::canonical_key(
                &message.sender_id,
                &message.receiver_id,
            )),
            Destination::SubjectTopic(message.sender_id.clone()),
            Destination::SubjectTopic(message.receiver_id.clone()),
        ]
    }

    /// Delivers `message` to every destination independently. Failures are
    /// recorded in the report and counted, never propagated — the message is
    /// already persisted by the time this runs. At-most-once per destination
    /// per call, no retries; calling twice produces two full rounds.
    pub fn dispatch(&self, message: &ChatMessage) -> DispatchReport {
        let frame = match protocol::encode_server_frame(&protocol::create_message(message)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode delivery frame: {}", e);
                let outcomes = Self::destinations(message)
                    .into_iter()
                    .map(|destination| {
                        self.metrics.deliveries_attempted.inc();
                        self.metrics.deliveries_failed.inc();
                        DeliveryOutcome {
                            destination,
                            result: Err(RelayError::DeliveryFailed(format!(
                                "frame encoding failed: {}",
                                e
                            ))),
                        }
                    })
                    .collect();
                return DispatchReport { outcomes };
            }
        };

        let mut report = DispatchReport::default();
        for destination in Self::destinations(message) {
            self.metrics.deliveries_attempted.inc();

            let sent = match &destination {
                Destination::ReceiverPrivate(id) | Destination::SenderPrivate(id) => self
                    .registry
                    .send_private(id, OutboundFrame { data: frame.clone() }),
                Destination::ConversationTopic(topic) | Destination::SubjectTopic(topic) => self
                    .registry
                    .publish(topic, OutboundFrame { data: frame.clone() }),
            };

            let result = if sent.refused == 0 {
                Ok(sent.queued)
            } else {
                self.metrics.deliveries_failed.inc();
                warn!(
                    kind = destination.kind(),
                    refused = sent.refused,
                    queued = sent.queued,
                    "fan-out destination refused delivery"
                );
                Err(RelayError::DeliveryFailed(format!(
                    "{}: {} of {} channel sends refused",
                    destination.kind(),
                    sent.refused,
                    sent.queued + sent.refused
                )))
            };

            report.outcomes.push(DeliveryOutcome {
                destination,
                result,
            });
        }
        report
    }

    /// Best-effort typing indicator, delivered to the receiver's private
    /// channel only. No persistence.
    pub fn deliver_typing(&self, sender_id: &str, receiver_id: &str, is_typing: bool) {
        if let Ok(data) =
            protocol::encode_server_frame(&protocol::create_typing(sender_id, is_typing))
        {
            self.registry
                .send_private(receiver_id, OutboundFrame { data });
        }
    }

    /// Best-effort publish of a presence/status/join event on the
    /// well-known presence topic.
    pub fn publish_presence(&self, event: &protocol::ServerFrame) {
        if let Ok(data) = protocol::encode_server_frame(event) {
            self.registry
                .publish(conversation::PRESENCE_TOPIC, OutboundFrame { data });
        }
    }
}
