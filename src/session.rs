// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Sessions
//!
//! A session binds one verified subject to one live connection. The binding
//! is write-once: the index refuses a second bind for the same connection id,
//! so a racing handshake and first control frame can never disagree about who
//! a connection speaks for. Reads after the bind need no coordination.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Instant;

use uuid::Uuid;

/// Reserved prefix marking relay-generated anonymous identities.
pub const ANONYMOUS_PREFIX: &str = "anonymous-";

/// Verified external identity, the sole authorization key for "may this
/// connection send as X".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        SubjectId(id.into())
    }

    /// Fresh anonymous identity, unique per call and distinguishable from any
    /// provider-issued subject by its reserved prefix.
    pub fn anonymous() -> Self {
        SubjectId(format!("{}{}", ANONYMOUS_PREFIX, Uuid::new_v4()))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    /// Short label for logs. Subjects are only logged at debug level, the
    /// connection label is what ties a connection's log lines together.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable record of one authenticated connection. Destroyed when the
/// underlying connection closes.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub subject: SubjectId,
    pub authenticated_at: Instant,
}

impl Session {
    pub fn is_anonymous(&self) -> bool {
        self.subject.is_anonymous()
    }
}

/// Live sessions keyed by connection id.
#[derive(Default)]
pub struct SessionIndex {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `subject` to `connection_id`. Returns the new session, or `None`
    /// when the connection is already bound; the existing binding stays
    /// authoritative.
    pub fn bind(&self, connection_id: ConnectionId, subject: SubjectId) -> Option<Session> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.entry(connection_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let session = Session {
                    connection_id,
                    subject,
                    authenticated_at: Instant::now(),
                };
                slot.insert(session.clone());
                Some(session)
            }
        }
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.read().unwrap().get(&connection_id).cloned()
    }

    /// Drops the session when its connection closes.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.write().unwrap().remove(&connection_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}
