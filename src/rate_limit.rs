//! Rate Limiting
//!
//! Token bucket rate limiter, one bucket per subject. A frame that finds the
//! bucket empty is refused with an explicit error frame rather than a closed
//! connection, so well-behaved clients can back off and retry.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Refill state for one subject. The policy itself (capacity and refill
/// rate) lives on the limiter, since every subject shares the same budget.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

/// Per-subject rate limiter. Anonymous subjects get their own buckets like
/// any other subject; the per-connection uuid suffix keeps them apart.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Bucket>>,
    /// Bucket capacity, also the budget a new subject starts with.
    capacity: f64,
    /// Tokens earned back per second of idleness.
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            capacity: max_per_minute as f64,
            refill_per_sec: max_per_minute as f64 / 60.0,
        }
    }

    /// Tries to consume a token for this subject.
    ///
    /// Returns true if allowed, false if rate limited. A subject seen for
    /// the first time starts with a full budget.
    pub fn consume(&self, subject_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets.entry(subject_id.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            touched: now,
        });

        let idle = now.duration_since(bucket.touched).as_secs_f64();
        bucket.tokens = (bucket.tokens + idle * self.refill_per_sec).min(self.capacity);
        bucket.touched = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Removes buckets that have not been touched for `max_idle`. Returns
    /// the number of buckets removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap();
        let now = Instant::now();
        let before = buckets.len();

        buckets.retain(|_, bucket| now.duration_since(bucket.touched) < max_idle);

        before - buckets.len()
    }

    /// Number of subjects currently tracked.
    pub fn subject_count(&self) -> usize {
        let buckets = self.buckets.read().unwrap();
        buckets.len()
    }
}
