// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Conversation Keys
//!
//! Derives the canonical, order-independent key for a pair of subjects. The
//! key doubles as the shared topic name for that conversation, so both
//! participants resolve the same topic no matter who is sending.

/// Well-known topic carrying presence, status, and join/leave events.
pub const PRESENCE_TOPIC: &str = "user-status";

/// Canonical key for the conversation between `a` and `b`: the two ids sorted
/// by ordinal comparison and joined with an underscore. Commutative and
/// deterministic; no failure modes.
pub fn canonical_key(a: &str, b: &str) -> String {
    if a < b {
        format!("{}_{}", a, b)
    } else {
        format!("{}_{}", b, a)
    }
}
