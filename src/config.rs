//! Relay Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::AuthPolicy;
use crate::store::StoreBackend;

/// Chat relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds.
    pub listen_addr: SocketAddr,
    /// Address the HTTP API / metrics listener binds.
    pub http_addr: SocketAddr,
    /// Policy applied at every authentication decision point.
    pub auth_policy: AuthPolicy,
    /// Identity provider endpoint for credential verification.
    /// Required when the policy is `reject`.
    pub auth_endpoint: Option<String>,
    /// Timeout for verifier calls in milliseconds.
    pub auth_timeout_ms: u64,
    /// Push notification endpoint. Absent means notifications are disabled.
    pub notify_endpoint: Option<String>,
    /// Timeout for notification calls in milliseconds.
    pub notify_timeout_ms: u64,
    /// Message store backend (memory or sqlite).
    pub store_backend: StoreBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_frame_bytes: usize,
    /// Maximum chat body length in characters.
    pub max_body_chars: usize,
    /// Cap on "recent history" query results.
    pub history_limit: usize,
    /// Rate limit (frames per minute per subject).
    pub rate_limit_per_min: u32,
    /// Idle timeout in seconds (for slowloris protection).
    pub idle_timeout_secs: u64,
    /// Interval for background cleanup of idle rate-limiter state, seconds.
    pub cleanup_interval_secs: u64,
    /// Bearer token protecting the /metrics endpoint.
    pub metrics_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            http_addr: "0.0.0.0:9090".parse().unwrap(),
            auth_policy: AuthPolicy::Reject,
            auth_endpoint: None,
            auth_timeout_ms: 3_000,
            notify_endpoint: None,
            notify_timeout_ms: 5_000,
            store_backend: StoreBackend::Sqlite, // Persistent by default
            data_dir: PathBuf::from("./data"),
            max_connections: 1000,
            max_frame_bytes: 65_536, // 64 KB, plenty for a capped chat body
            max_body_chars: 1000,
            history_limit: 50,
            rate_limit_per_min: 60,
            idle_timeout_secs: 300, // 5 minutes (slowloris protection)
            cleanup_interval_secs: 3600, // 1 hour
            metrics_token: None,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CHAT_RELAY_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("CHAT_RELAY_HTTP_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.http_addr = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_AUTH_POLICY") {
            config.auth_policy = match val.to_lowercase().as_str() {
                "allow-anonymous" | "allow_anonymous" => AuthPolicy::AllowAnonymous,
                _ => AuthPolicy::Reject,
            };
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_AUTH_ENDPOINT") {
            if !val.is_empty() {
                config.auth_endpoint = Some(val);
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_AUTH_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse() {
                config.auth_timeout_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_NOTIFY_ENDPOINT") {
            if !val.is_empty() {
                config.notify_endpoint = Some(val);
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_NOTIFY_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse() {
                config.notify_timeout_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_STORE_BACKEND") {
            config.store_backend = match val.to_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                _ => StoreBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_MAX_FRAME_BYTES") {
            if let Ok(parsed) = val.parse() {
                config.max_frame_bytes = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_MAX_BODY_CHARS") {
            if let Ok(parsed) = val.parse() {
                config.max_body_chars = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_HISTORY_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.history_limit = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_RATE_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.rate_limit_per_min = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_CLEANUP_INTERVAL") {
            if let Ok(parsed) = val.parse() {
                config.cleanup_interval_secs = parsed;
            }
        }

        if let Ok(val) = std::env::var("CHAT_RELAY_METRICS_TOKEN") {
            if !val.is_empty() {
                config.metrics_token = Some(val);
            }
        }

        config
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns the verifier call timeout as a Duration.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Returns the notification call timeout as a Duration.
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    /// Returns the cleanup interval as a Duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
