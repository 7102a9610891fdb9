//! HTTP Chat API
//!
//! The request/response ingress: a send endpoint that runs the same relay
//! pipeline as the WebSocket path, conversation history queries, and the
//! health/info/metrics endpoints. Health and info are open; the chat API
//! resolves a subject per request under the relay's authentication policy;
//! metrics take an optional dedicated bearer token.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::auth::{self, ConnectionAuthenticator};
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::protocol::ChatSend;
use crate::relay::MessageRelayService;
use crate::session::{SessionIndex, SubjectId};
use crate::store::{ChatMessage, MessageStore, StoreBackend};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub relay: Arc<MessageRelayService>,
    pub store: Arc<dyn MessageStore>,
    pub sessions: Arc<SessionIndex>,
    pub authenticator: Arc<ConnectionAuthenticator>,
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    pub history_limit: usize,
    pub backend: StoreBackend,
    pub started_at: Instant,
}

/// Request-level authentication. Health and info pass through, metrics get
/// the bearer-token check, and every chat API request resolves a subject
/// the same way a connection handshake does.
async fn auth_middleware(
    State(state): State<HttpState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if path == "/health" || path == "/info" {
        return next.run(request).await;
    }

    if path == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let auth_header = request.headers().get(header::AUTHORIZATION);
            let is_authorized = auth_header.is_some_and(|h| {
                h.to_str()
                    .map(|s| {
                        s.strip_prefix("Bearer ")
                            .is_some_and(|token| token == expected_token)
                    })
                    .unwrap_or(false)
            });

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
        return next.run(request).await;
    }

    // Chat API: same credential carriers and policy as the WebSocket
    // ingress. The resolved subject rides in request extensions.
    let credential = auth::extract_credential(request.headers(), request.uri());
    match state.authenticator.resolve(credential.as_deref()).await {
        Ok(subject) => {
            request.extensions_mut().insert(subject);
            next.run(request).await
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(serde_json::json!({
                "error": e.code(),
                "reason": e.to_string(),
            })),
        )
            .into_response(),
    }
}

/// Creates the HTTP router with the chat API and monitoring endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/chat/send", post(send_handler))
        .route("/api/chat/history", get(history_handler))
        .route("/api/chat/recent", get(recent_handler))
        .route("/api/chat/sent/:user_id", get(sent_handler))
        .route("/api/chat/received/:user_id", get(received_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Both participants of a conversation, in either order.
#[derive(Debug, Deserialize)]
struct ConversationQuery {
    user1: String,
    user2: String,
}

/// Synchronous send: runs the full relay pipeline and returns the persisted
/// message. Delivery to live connections happens as a side effect.
async fn send_handler(
    State(state): State<HttpState>,
    Extension(subject): Extension<SubjectId>,
    Json(request): Json<ChatSend>,
) -> Result<Json<ChatMessage>, RelayError> {
    let message = state
        .relay
        .relay_synchronous(
            &subject,
            &request.sender_id,
            &request.receiver_id,
            &request.body,
            request.sender_name.as_deref(),
        )
        .await?;
    Ok(Json(message))
}

/// Full conversation between two users, oldest first.
async fn history_handler(
    State(state): State<HttpState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<ChatMessage>>, RelayError> {
    let messages = state.store.find_between(&query.user1, &query.user2)?;
    Ok(Json(messages))
}

/// Most recent messages between two users, newest first, capped.
async fn recent_handler(
    State(state): State<HttpState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<ChatMessage>>, RelayError> {
    let messages = state
        .store
        .find_recent_between(&query.user1, &query.user2, state.history_limit)?;
    Ok(Json(messages))
}

/// All messages sent by a user, newest first.
async fn sent_handler(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, RelayError> {
    let messages = state.store.find_by_sender(&user_id)?;
    Ok(Json(messages))
}

/// All messages received by a user, newest first.
async fn received_handler(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, RelayError> {
    let messages = state.store.find_by_receiver(&user_id)?;
    Ok(Json(messages))
}

/// Health check endpoint - always returns 200 if the server is running.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "message_count": state.store.message_count(),
        "active_sessions": state.sessions.session_count(),
    }))
}

/// Service description for operators and clients.
async fn info_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "confab-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "store_backend": format!("{:?}", state.backend),
        "auth_policy": format!("{:?}", state.authenticator.policy()),
        "endpoints": [
            "/api/chat/send",
            "/api/chat/history",
            "/api/chat/recent",
            "/api/chat/sent/:user_id",
            "/api/chat/received/:user_id",
        ],
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthPolicy, StaticTokenVerifier};
    use crate::channel_registry::ChannelRegistry;
    use crate::fanout::FanoutEngine;
    use crate::notify::NullNotificationSink;
    use crate::store::MemoryMessageStore;
    use axum::body::Body;
    use tower::ServiceExt;

    fn create_test_state(policy: AuthPolicy, metrics_token: Option<String>) -> HttpState {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let metrics = RelayMetrics::new();
        let registry = Arc::new(ChannelRegistry::new());
        let fanout = Arc::new(FanoutEngine::new(registry, metrics.clone()));
        let verifier = StaticTokenVerifier::new().with_token("tok", "u1");
        let authenticator = Arc::new(ConnectionAuthenticator::new(Arc::new(verifier), policy));
        let relay = Arc::new(MessageRelayService::new(
            Arc::clone(&store),
            fanout,
            Arc::clone(&authenticator),
            Arc::new(NullNotificationSink),
            metrics.clone(),
            1000,
        ));

        HttpState {
            relay,
            store,
            sessions: Arc::new(SessionIndex::new()),
            authenticator,
            metrics,
            metrics_token,
            history_limit: 50,
            backend: StoreBackend::Memory,
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint_is_open() {
        let app = create_router(create_test_state(AuthPolicy::Reject, None));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_requires_token_when_configured() {
        let app = create_router(create_test_state(
            AuthPolicy::AllowAnonymous,
            Some("secret".to_string()),
        ));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_send_without_credential_is_unauthorized_under_reject() {
        let app = create_router(create_test_state(AuthPolicy::Reject, None));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/send")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"senderId":"u1","receiverId":"u2","message":"hi"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_send_with_credential_persists_message() {
        let state = create_test_state(AuthPolicy::Reject, None);
        let store = Arc::clone(&state.store);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/send")
                    .header(header::AUTHORIZATION, "Bearer tok")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"senderId":"u1","receiverId":"u2","message":"hi"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.message_count(), 1);
    }
}
