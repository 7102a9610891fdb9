//! Prometheus Metrics for the Chat Relay
//!
//! Provides observability metrics for monitoring the relay server.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Chat relay metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (failed upgrades, broken sockets, etc.).
    pub connection_errors: IntCounter,

    // Handshake outcomes
    /// Sessions bound to a verified subject.
    pub handshakes_verified: IntCounter,
    /// Sessions bound to a generated anonymous subject.
    pub handshakes_anonymous: IntCounter,
    /// Handshakes refused by the authentication policy.
    pub handshakes_rejected: IntCounter,

    // Relay pipeline
    /// Messages validated, persisted, and fanned out.
    pub messages_relayed: IntCounter,
    /// Messages rejected before persistence (payload or authorization).
    pub messages_rejected: IntCounter,
    /// Message store write failures.
    pub persistence_failures: IntCounter,
    /// Relay pipeline duration in seconds.
    pub relay_duration: Histogram,

    // Fan-out
    /// Individual delivery attempts across all destinations.
    pub deliveries_attempted: IntCounter,
    /// Delivery attempts refused by a destination channel.
    pub deliveries_failed: IntCounter,

    // Notifications
    /// Push notifications accepted by the sink.
    pub notifications_sent: IntCounter,
    /// Push notifications that failed.
    pub notifications_failed: IntCounter,

    // Signals
    /// Typing indicator frames relayed.
    pub typing_events: IntCounter,

    // Rate limiting
    /// Frames rate limited.
    pub rate_limited: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_total = IntCounter::with_opts(Opts::new(
            "chat_relay_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "chat_relay_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "chat_relay_connection_errors_total",
            "Total connection errors",
        ))
        .unwrap();

        // Handshake outcomes
        let handshakes_verified = IntCounter::with_opts(Opts::new(
            "chat_relay_handshakes_verified_total",
            "Sessions bound to a verified subject",
        ))
        .unwrap();

        let handshakes_anonymous = IntCounter::with_opts(Opts::new(
            "chat_relay_handshakes_anonymous_total",
            "Sessions bound to a generated anonymous subject",
        ))
        .unwrap();

        let handshakes_rejected = IntCounter::with_opts(Opts::new(
            "chat_relay_handshakes_rejected_total",
            "Handshakes refused by the authentication policy",
        ))
        .unwrap();

        // Relay pipeline
        let messages_relayed = IntCounter::with_opts(Opts::new(
            "chat_relay_messages_relayed_total",
            "Messages validated, persisted, and fanned out",
        ))
        .unwrap();

        let messages_rejected = IntCounter::with_opts(Opts::new(
            "chat_relay_messages_rejected_total",
            "Messages rejected before persistence",
        ))
        .unwrap();

        let persistence_failures = IntCounter::with_opts(Opts::new(
            "chat_relay_persistence_failures_total",
            "Message store write failures",
        ))
        .unwrap();

        let relay_duration = Histogram::with_opts(HistogramOpts::new(
            "chat_relay_relay_duration_seconds",
            "Relay pipeline duration in seconds",
        ))
        .unwrap();

        // Fan-out
        let deliveries_attempted = IntCounter::with_opts(Opts::new(
            "chat_relay_deliveries_attempted_total",
            "Individual fan-out delivery attempts",
        ))
        .unwrap();

        let deliveries_failed = IntCounter::with_opts(Opts::new(
            "chat_relay_deliveries_failed_total",
            "Fan-out delivery attempts refused by a destination",
        ))
        .unwrap();

        // Notifications
        let notifications_sent = IntCounter::with_opts(Opts::new(
            "chat_relay_notifications_sent_total",
            "Push notifications accepted by the sink",
        ))
        .unwrap();

        let notifications_failed = IntCounter::with_opts(Opts::new(
            "chat_relay_notifications_failed_total",
            "Push notifications that failed",
        ))
        .unwrap();

        // Signals
        let typing_events = IntCounter::with_opts(Opts::new(
            "chat_relay_typing_events_total",
            "Typing indicator frames relayed",
        ))
        .unwrap();

        // Rate limiting
        let rate_limited = IntCounter::with_opts(Opts::new(
            "chat_relay_rate_limited_total",
            "Total frames rate limited",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(handshakes_verified.clone()))
            .unwrap();
        registry
            .register(Box::new(handshakes_anonymous.clone()))
            .unwrap();
        registry
            .register(Box::new(handshakes_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_relayed.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(persistence_failures.clone()))
            .unwrap();
        registry.register(Box::new(relay_duration.clone())).unwrap();
        registry
            .register(Box::new(deliveries_attempted.clone()))
            .unwrap();
        registry
            .register(Box::new(deliveries_failed.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_sent.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_failed.clone()))
            .unwrap();
        registry.register(Box::new(typing_events.clone())).unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            handshakes_verified,
            handshakes_anonymous,
            handshakes_rejected,
            messages_relayed,
            messages_rejected,
            persistence_failures,
            relay_duration,
            deliveries_attempted,
            deliveries_failed,
            notifications_sent,
            notifications_failed,
            typing_events,
            rate_limited,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
