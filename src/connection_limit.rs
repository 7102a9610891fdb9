//! Connection Limiting
//!
//! Caps concurrent WebSocket connections. The accept loop takes a slot
//! before spawning a session task and the RAII guard gives it back when the
//! task finishes, whichever way it exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Hands out connection slots up to a fixed cap.
///
/// Clones share the same slot count, so the accept loop can keep one handle
/// while guards travel into session tasks.
#[derive(Clone)]
pub struct ConnectionLimiter {
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Tries to acquire a connection slot.
    ///
    /// Returns `None` when every slot is taken. The returned guard releases
    /// its slot on drop.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active: Arc::clone(&self.active),
            })
    }

    /// Current number of active connections.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The configured cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII guard for one connection slot.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
