//! Message Storage
//!
//! Storage backends for relayed chat messages. Supports both in-memory (for
//! testing and development) and SQLite (for production). A message must be
//! written here before any fan-out happens; the history queries back the
//! request/response API.

use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A persisted chat message. `id` and `created_at` are assigned at creation
/// and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned message id. Stable across every delivery of the
    /// message, which is what clients dedupe on.
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// Message text. Serialized as `message` on the wire.
    #[serde(rename = "message")]
    pub body: String,
    /// Serialized as `timestamp` on the wire (RFC 3339).
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates a message with a fresh id and the current time.
    pub fn new(sender_id: &str, receiver_id: &str, body: &str) -> Self {
        // Millisecond precision, matching what the SQLite backend persists,
        // so a saved message round-trips exactly.
        let now_ms = Utc::now().timestamp_millis();
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: body.to_string(),
            created_at: Utc.timestamp_millis_opt(now_ms).single().unwrap_or_default(),
        }
    }
}

/// Storage-boundary failure. Saving surfaces these to the relay call as
/// `PERSISTENCE_FAILED`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The backend is not reachable. Produced by store implementations that
    /// front a remote database; the bundled backends never return it.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Trait for message storage backends.
pub trait MessageStore: Send + Sync {
    /// Persists a message and returns it with its assigned id and timestamp.
    fn save(&self, sender_id: &str, receiver_id: &str, body: &str)
        -> Result<ChatMessage, StoreError>;

    /// All messages exchanged between `a` and `b`, in either direction,
    /// oldest first. Symmetric: `(a, b)` and `(b, a)` return the same set.
    fn find_between(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Most recent messages between `a` and `b`, newest first, capped at
    /// `limit`.
    fn find_recent_between(
        &self,
        a: &str,
        b: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// All messages sent by `sender_id`, newest first.
    fn find_by_sender(&self, sender_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// All messages received by `receiver_id`, newest first.
    fn find_by_receiver(&self, receiver_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// In-memory message storage. Vec order is insertion order, which is the
/// chronological order the queries are defined against.
pub struct MemoryMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        MemoryMessageStore {
            messages: RwLock::new(Vec::new()),
        }
    }

    fn involves(message: &ChatMessage, a: &str, b: &str) -> bool {
        (message.sender_id == a && message.receiver_id == b)
            || (message.sender_id == b && message.receiver_id == a)
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn save(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage::new(sender_id, receiver_id, body);
        self.messages.write().unwrap().push(message.clone());
        Ok(message)
    }

    fn find_between(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().unwrap();
        Ok(messages
            .iter()
            .filter(|m| Self::involves(m, a, b))
            .cloned()
            .collect())
    }

    fn find_recent_between(
        &self,
        a: &str,
        b: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().unwrap();
        Ok(messages
            .iter()
            .rev()
            .filter(|m| Self::involves(m, a, b))
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_by_sender(&self, sender_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().unwrap();
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.sender_id == sender_id)
            .cloned()
            .collect())
    }

    fn find_by_receiver(&self, receiver_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().unwrap();
        Ok(messages
            .iter()
            .rev()
            .filter(|m| m.receiver_id == receiver_id)
            .cloned()
            .collect())
    }

    fn message_count(&self) -> usize {
        self.messages.read().unwrap().len()
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent message storage.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent performance
        // WAL allows readers and writers to operate concurrently
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        // Bounded wait on a locked database; past this a call fails instead
        // of hanging the relay.
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        // Create table if not exists. The implicit rowid is the insertion
        // order and breaks timestamp ties in the ordered queries.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )",
            [],
        )?;

        // Indexes for the pair and single-participant lookups
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair
             ON messages(sender_id, receiver_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id)",
            [],
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, rusqlite::Error> {
        let created_at_ms: i64 = row.get(4)?;
        Ok(ChatMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            receiver_id: row.get(2)?,
            body: row.get(3)?,
            created_at: Utc
                .timestamp_millis_opt(created_at_ms)
                .single()
                .unwrap_or_default(),
        })
    }

    fn query_messages(
        &self,
        sql: &str,
        query_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(query_params, Self::row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl MessageStore for SqliteMessageStore {
    fn save(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage::new(sender_id, receiver_id, body);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, body, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.sender_id,
                message.receiver_id,
                message.body,
                message.created_at.timestamp_millis()
            ],
        )?;
        Ok(message)
    }

    fn find_between(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.query_messages(
            "SELECT id, sender_id, receiver_id, body, created_at_ms
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at_ms ASC, rowid ASC",
            &[&a, &b],
        )
    }

    fn find_recent_between(
        &self,
        a: &str,
        b: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.query_messages(
            "SELECT id, sender_id, receiver_id, body, created_at_ms
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at_ms DESC, rowid DESC
             LIMIT ?3",
            &[&a, &b, &(limit as i64)],
        )
    }

    fn find_by_sender(&self, sender_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.query_messages(
            "SELECT id, sender_id, receiver_id, body, created_at_ms
             FROM messages WHERE sender_id = ?1
             ORDER BY created_at_ms DESC, rowid DESC",
            &[&sender_id],
        )
    }

    fn find_by_receiver(&self, receiver_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.query_messages(
            "SELECT id, sender_id, receiver_id, body, created_at_ms
             FROM messages WHERE receiver_id = ?1
             ORDER BY created_at_ms DESC, rowid DESC",
            &[&receiver_id],
        )
    }

    fn message_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StoreBackend,
    data_dir: Option<&Path>,
) -> Box<dyn MessageStore> {
    match backend {
        StoreBackend::Memory => Box::new(MemoryMessageStore::new()),
        StoreBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("messages.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("messages.db"));

            // Ensure directory exists
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Box::new(SqliteMessageStore::open(&path).expect("Failed to open SQLite database"))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
