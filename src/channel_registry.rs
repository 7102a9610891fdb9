// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel Registry
//!
//! Routing table for live connections. Every bound connection is registered
//! under its subject's private channel (a subject may hold several
//! connections at once — multi-device); connections can additionally
//! subscribe to named topics. The fan-out engine delivers through this
//! registry with non-blocking sends, so a slow consumer can only lose its
//! own deliveries.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::session::ConnectionId;

/// An encoded server frame queued for one connection's writer task.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub data: String,
}

/// Result of one delivery attempt against a channel or topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOutcome {
    /// Connections the frame was queued for.
    pub queued: usize,
    /// Connections that refused the frame (queue full or receiver gone).
    pub refused: usize,
}

struct ChannelMember {
    connection_id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
}

/// Thread-safe registry of private channels and topic subscriptions.
pub struct ChannelRegistry {
    privates: RwLock<HashMap<String, Vec<ChannelMember>>>,
    topics: RwLock<HashMap<String, Vec<ChannelMember>>>,
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<OutboundFrame>>>,
}

impl ChannelRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        ChannelRegistry {
            privates: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a bound connection under its subject's private channel.
    /// Returns the receiving end the connection's writer drains. Other
    /// connections of the same subject are unaffected.
    pub fn register(
        &self,
        subject_id: &str,
        connection_id: ConnectionId,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(64);

        self.senders
            .write()
            .unwrap()
            .insert(connection_id, tx.clone());
        self.privates
            .write()
            .unwrap()
            .entry(subject_id.to_string())
            .or_default()
            .push(ChannelMember { connection_id, tx });
        rx
    }

    /// Removes a connection from its private channel and every topic it
    /// subscribed to. Called when the connection closes.
    pub fn unregister(&self, subject_id: &str, connection_id: ConnectionId) {
        self.senders.write().unwrap().remove(&connection_id);

        let mut privates = self.privates.write().unwrap();
        if let Some(members) = privates.get_mut(subject_id) {
            members.retain(|m| m.connection_id != connection_id);
            if members.is_empty() {
                privates.remove(subject_id);
            }
        }
        drop(privates);

        let mut topics = self.topics.write().unwrap();
        topics.retain(|_, members| {
            members.retain(|m| m.connection_id != connection_id);
            !members.is_empty()
        });
    }

    /// Subscribes a registered connection to a topic. Returns false when the
    /// connection is not registered (never bound, or already gone).
    pub fn subscribe(&self, topic: &str, connection_id: ConnectionId) -> bool {
        let tx = match self.senders.read().unwrap().get(&connection_id) {
            Some(tx) => tx.clone(),
            None => return false,
        };

        let mut topics = self.topics.write().unwrap();
        let members = topics.entry(topic.to_string()).or_default();
        if members.iter().any(|m| m.connection_id == connection_id) {
            return true; // already subscribed
        }
        members.push(ChannelMember { connection_id, tx });
        true
    }

    /// Removes a connection from a topic.
    pub fn unsubscribe(&self, topic: &str, connection_id: ConnectionId) {
        let mut topics = self.topics.write().unwrap();
        if let Some(members) = topics.get_mut(topic) {
            members.retain(|m| m.connection_id != connection_id);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Queues a frame for every connection on a subject's private channel.
    /// Zero registered connections is a successful send to zero receivers.
    pub fn send_private(&self, subject_id: &str, frame: OutboundFrame) -> SendOutcome {
        let mut privates = self.privates.write().unwrap();
        let outcome = match privates.get_mut(subject_id) {
            Some(members) => Self::deliver(members, frame),
            None => SendOutcome::default(),
        };
        if matches!(privates.get(subject_id), Some(m) if m.is_empty()) {
            privates.remove(subject_id);
        }
        outcome
    }

    /// Queues a frame for every subscriber of a topic.
    pub fn publish(&self, topic: &str, frame: OutboundFrame) -> SendOutcome {
        let mut topics = self.topics.write().unwrap();
        let outcome = match topics.get_mut(topic) {
            Some(members) => Self::deliver(members, frame),
            None => SendOutcome::default(),
        };
        if matches!(topics.get(topic), Some(m) if m.is_empty()) {
            topics.remove(topic);
        }
        outcome
    }

    /// Non-blocking send to every member. Members whose receiver is gone are
    /// dropped from the list; a full queue counts as refused but the member
    /// stays (backpressure, not death).
    fn deliver(members: &mut Vec<ChannelMember>, frame: OutboundFrame) -> SendOutcome {
        let mut outcome = SendOutcome::default();
        members.retain(|m| match m.tx.try_send(frame.clone()) {
            Ok(()) => {
                outcome.queued += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                outcome.refused += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                outcome.refused += 1;
                false
            }
        });
        outcome
    }

    /// Returns the number of currently registered connections.
    pub fn connected_count(&self) -> usize {
        self.senders.read().unwrap().len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
