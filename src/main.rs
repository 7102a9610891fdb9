// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Confab Relay Server
//!
//! A real-time relay for one-to-one chat. Provides:
//! - WebSocket endpoint for authenticated chat sessions with live delivery
//! - HTTP chat API (synchronous send, conversation history)
//! - Health checks and Prometheus metrics
//! - Rate limiting and abuse prevention

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use confab_relay::auth::{
    AuthPolicy, ConnectionAuthenticator, HttpTokenVerifier, StaticTokenVerifier, TokenVerifier,
};
use confab_relay::channel_registry::ChannelRegistry;
use confab_relay::config::RelayConfig;
use confab_relay::connection_limit::ConnectionLimiter;
use confab_relay::fanout::FanoutEngine;
use confab_relay::handler;
use confab_relay::http::{create_router, HttpState};
use confab_relay::metrics::RelayMetrics;
use confab_relay::notify::{HttpNotificationSink, NotificationSink, NullNotificationSink};
use confab_relay::rate_limit::RateLimiter;
use confab_relay::relay::MessageRelayService;
use confab_relay::session::SessionIndex;
use confab_relay::store::{create_message_store, MessageStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("confab_relay=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env();

    // A reject policy with no identity provider would refuse every single
    // connection. Refuse to start instead.
    if config.auth_policy == AuthPolicy::Reject && config.auth_endpoint.is_none() {
        error!("=======================================================================");
        error!("CONFIGURATION ERROR: reject policy without an identity provider");
        error!("=======================================================================");
        error!("");
        error!("The relay is configured to reject unauthenticated connections but no");
        error!("endpoint is available to verify credentials, so every connection and");
        error!("request would be refused.");
        error!("");
        error!("To fix this, either:");
        error!("  1. Configure the identity provider:");
        error!("     CHAT_RELAY_AUTH_ENDPOINT=https://auth.example.com/verify");
        error!("");
        error!("  2. Allow anonymous sessions (development only):");
        error!("     CHAT_RELAY_AUTH_POLICY=allow-anonymous");
        error!("=======================================================================");
        std::process::exit(1);
    }

    info!(
        "Starting Confab Relay Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("WebSocket: {}", config.listen_addr);
    info!("HTTP API: {}", config.http_addr);
    info!("Auth policy: {:?}", config.auth_policy);
    info!("Storage backend: {:?}", config.store_backend);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    // Initialize metrics
    let metrics = RelayMetrics::new();

    // Initialize shared state
    let store: Arc<dyn MessageStore> = Arc::from(create_message_store(
        config.store_backend,
        Some(&config.data_dir),
    ));

    let verifier: Arc<dyn TokenVerifier> = match config.auth_endpoint {
        Some(ref endpoint) => {
            info!("Identity provider: {}", endpoint);
            Arc::new(HttpTokenVerifier::new(
                endpoint.clone(),
                config.auth_timeout(),
            ))
        }
        None => {
            // Only reachable under the anonymous-fallback policy (the guard
            // above exits otherwise). With no provider every offered
            // credential fails verification and falls back to anonymous.
            info!("No identity provider configured; all sessions will be anonymous");
            Arc::new(StaticTokenVerifier::new())
        }
    };
    let authenticator = Arc::new(ConnectionAuthenticator::new(verifier, config.auth_policy));

    let notifier: Arc<dyn NotificationSink> = match config.notify_endpoint {
        Some(ref endpoint) => {
            info!("Push notifications: {}", endpoint);
            Arc::new(HttpNotificationSink::new(
                endpoint.clone(),
                config.notify_timeout(),
            ))
        }
        None => {
            info!("Push notifications: disabled");
            Arc::new(NullNotificationSink)
        }
    };

    let sessions = Arc::new(SessionIndex::new());
    let registry = Arc::new(ChannelRegistry::new());
    let fanout = Arc::new(FanoutEngine::new(Arc::clone(&registry), metrics.clone()));
    let relay = Arc::new(MessageRelayService::new(
        Arc::clone(&store),
        fanout,
        Arc::clone(&authenticator),
        notifier,
        metrics.clone(),
        config.max_body_chars,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);

    // Metrics exposure note (metrics can reveal usage patterns)
    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.http_addr.ip().is_loopback() {
        info!("WARNING: Metrics exposed on non-localhost without auth token");
        info!("Consider setting CHAT_RELAY_METRICS_TOKEN for production use");
    }

    // Start HTTP server for the chat API, health and metrics
    let http_state = HttpState {
        relay: Arc::clone(&relay),
        store: Arc::clone(&store),
        sessions: Arc::clone(&sessions),
        authenticator: Arc::clone(&authenticator),
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        history_limit: config.history_limit,
        backend: config.store_backend,
        started_at: Instant::now(),
    };
    let http_router = create_router(http_state);

    let http_addr = config.http_addr;
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .expect("Failed to bind HTTP listener");

    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        axum::serve(http_listener, http_router).await.unwrap();
    });

    // Start cleanup task for rate limiters (remove stale subject buckets)
    let cleanup_rate_limiter = Arc::clone(&rate_limiter);
    let cleanup_interval = config.cleanup_interval();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleanup_interval).await;
            let removed =
                cleanup_rate_limiter.cleanup_inactive(std::time::Duration::from_secs(1800));
            if removed > 0 {
                info!(
                    "Cleaned up {} stale rate limiter entries ({} tracked)",
                    removed,
                    cleanup_rate_limiter.subject_count()
                );
            }
        }
    });

    // Start TCP listener for WebSocket
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");

    info!("WebSocket server listening on {}", config.listen_addr);

    let deps = handler::ConnectionDeps {
        authenticator,
        sessions,
        registry,
        relay,
        rate_limiter,
        metrics: metrics.clone(),
        max_frame_bytes: config.max_frame_bytes,
        idle_timeout: config.idle_timeout(),
    };

    // Accept connections
    while let Ok((stream, _addr)) = listener.accept().await {
        // Enforce connection limit
        let connection_guard = match connection_limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    connection_limiter.active_count(),
                    connection_limiter.max_connections()
                );
                metrics.connection_errors.inc();
                // Drop the stream to close the connection
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            // Keep the guard alive for the duration of the connection
            let _guard = connection_guard;
            handler::handle_connection(stream, deps).await;
        });
    }
}
