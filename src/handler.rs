// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Owns one client connection end to end: the HTTP upgrade with credential
//! extraction, identity binding, the frame loop, and teardown. Outbound
//! delivery multiplexes into the same loop through the channel registry, so
//! every frame a client receives goes through its own handler task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, warn};

use crate::auth::{self, AuthPolicy, ConnectionAuthenticator};
use crate::channel_registry::ChannelRegistry;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use crate::protocol::{self, ClientFrame};
use crate::rate_limit::RateLimiter;
use crate::relay::MessageRelayService;
use crate::session::{ConnectionId, Session, SessionIndex};

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Shared dependencies for handling a WebSocket connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub authenticator: Arc<ConnectionAuthenticator>,
    pub sessions: Arc<SessionIndex>,
    pub registry: Arc<ChannelRegistry>,
    pub relay: Arc<MessageRelayService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: RelayMetrics,
    pub max_frame_bytes: usize,
    pub idle_timeout: Duration,
}

/// Refusal sent during the upgrade when the policy demands a credential and
/// the request carries none.
fn unauthorized_upgrade() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(
        r#"{"error":"AUTH_REJECTED","reason":"no credential presented"}"#.to_string(),
    ));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Sends one server frame. Returns false when the socket is gone.
async fn send_frame(write: &mut WsWriter, frame: &protocol::ServerFrame) -> bool {
    match protocol::encode_server_frame(frame) {
        Ok(data) => write.send(Message::Text(data)).await.is_ok(),
        Err(e) => {
            error!("Failed to encode server frame: {}", e);
            true
        }
    }
}

/// Rate limiting is a transport concern, not a relay pipeline outcome, so
/// its error frame is built here rather than from a `RelayError`.
fn rate_limited_frame() -> protocol::ServerFrame {
    protocol::ServerFrame::Error(protocol::ErrorFrame {
        code: "RATE_LIMITED".to_string(),
        reason: "frame budget exhausted, slow down".to_string(),
    })
}

/// Handles a client connection from raw TCP stream to teardown.
///
/// The upgrade callback extracts the credential carrier (Authorization
/// header, `token` query parameter, or X-Auth-Token header) and refuses the
/// upgrade with 401 when the reject policy is active and no carrier is
/// present. Verification of an extracted credential happens after the
/// upgrade, on the authenticator.
pub async fn handle_connection(stream: TcpStream, deps: ConnectionDeps) {
    let policy = deps.authenticator.policy();
    let credential_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&credential_slot);

    let callback = move |request: &UpgradeRequest, response: UpgradeResponse| {
        let credential = auth::extract_credential(request.headers(), request.uri());
        if credential.is_none() && policy == AuthPolicy::Reject {
            return Err(unauthorized_upgrade());
        }
        *slot.lock().unwrap() = credential;
        Ok(response)
    };

    // Upgrade with timeout (slowloris protection).
    let ws_stream = match timeout(deps.idle_timeout, accept_hdr_async(stream, callback)).await {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(WsError::Http(_))) => {
            debug!("Upgrade refused: no credential presented");
            deps.metrics.handshakes_rejected.inc();
            return;
        }
        Ok(Err(e)) => {
            debug!("WebSocket handshake failed: {}", e);
            deps.metrics.connection_errors.inc();
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake timeout (slowloris protection)");
            deps.metrics.connection_errors.inc();
            return;
        }
    };

    deps.metrics.connections_total.inc();
    deps.metrics.connections_active.inc();

    let credential = credential_slot.lock().unwrap().take();
    run_session(ws_stream, &deps, credential).await;

    deps.metrics.connections_active.dec();
}

/// Runs one upgraded session: binds an identity, registers for delivery,
/// then processes frames until the connection ends.
async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    deps: &ConnectionDeps,
    credential: Option<String>,
) {
    let connection_id = ConnectionId::new();
    // Short random label for logs; subject ids stay out of info-level logs.
    let session_label = connection_id.short();

    let (mut write, mut read) = ws_stream.split();

    // Phase 1: bind an identity. A credential extracted during the upgrade
    // is verified here; without one the first data frame decides.
    let mut deferred: Option<ClientFrame> = None;
    let subject = match credential {
        Some(token) => match deps.authenticator.resolve(Some(&token)).await {
            Ok(subject) => subject,
            Err(e) => {
                warn!("[{}] Credential rejected: {}", session_label, e);
                deps.metrics.handshakes_rejected.inc();
                send_frame(&mut write, &protocol::create_error(&e)).await;
                let _ = write.send(Message::Close(None)).await;
                return;
            }
        },
        None => {
            // Reachable only under the anonymous-fallback policy; the
            // upgrade callback already refused the reject case.
            match bind_on_first_frame(&mut write, &mut read, deps, &session_label).await {
                Some((subject, frame)) => {
                    deferred = frame;
                    subject
                }
                None => return,
            }
        }
    };

    let session = match deps.sessions.bind(connection_id, subject) {
        Some(session) => session,
        None => {
            // Write-once index refused a fresh uuid; should not happen.
            error!("[{}] Connection id already bound", session_label);
            return;
        }
    };

    if session.is_anonymous() {
        deps.metrics.handshakes_anonymous.inc();
    } else {
        deps.metrics.handshakes_verified.inc();
    }

    debug!(
        "[{}] Session bound (anonymous: {})",
        session_label,
        session.is_anonymous()
    );

    let mut registry_rx = deps.registry.register(session.subject.as_str(), connection_id);

    // The welcome announces the identity every later frame is checked
    // against.
    let welcome = protocol::create_welcome(session.subject.as_str(), session.is_anonymous());
    if !send_frame(&mut write, &welcome).await {
        warn!("[{}] Failed to send welcome", session_label);
        deps.registry.unregister(session.subject.as_str(), connection_id);
        deps.sessions.remove(connection_id);
        return;
    }

    // A data frame that triggered anonymous binding is processed now, after
    // the welcome, like any other frame.
    if let Some(frame) = deferred.take() {
        process_frame(frame, &session, deps, &mut write, &session_label).await;
    }

    // Phase 2: the frame loop. select! multiplexes client reads with
    // outbound deliveries queued by other handlers and the HTTP ingress.
    loop {
        let msg = tokio::select! {
            ws_msg = timeout(deps.idle_timeout, read.next()) => {
                match ws_msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("[{}] Disconnected", session_label);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] Idle timeout (slowloris protection)", session_label);
                        break;
                    }
                }
            }
            Some(outbound) = registry_rx.recv() => {
                let _ = write.send(Message::Text(outbound.data)).await;
                continue;
            }
        };

        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > deps.max_frame_bytes {
                    warn!("[{}] Frame too large: {} bytes", session_label, text.len());
                    let error = RelayError::InvalidPayload("frame too large");
                    send_frame(&mut write, &protocol::create_error(&error)).await;
                    continue;
                }

                if !deps.rate_limiter.consume(session.subject.as_str()) {
                    debug!("[{}] Rate limited", session_label);
                    deps.metrics.rate_limited.inc();
                    send_frame(&mut write, &rate_limited_frame()).await;
                    continue;
                }

                let frame = match protocol::decode_client_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("[{}] Undecodable frame: {}", session_label, e);
                        let error = RelayError::InvalidPayload("malformed frame");
                        send_frame(&mut write, &protocol::create_error(&error)).await;
                        continue;
                    }
                };

                process_frame(frame, &session, deps, &mut write, &session_label).await;
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                debug!("[{}] Client sent close", session_label);
                break;
            }
            Ok(_) => {
                // Ignore binary, pong, etc.
            }
            Err(e) => {
                warn!("[{}] Connection error: {}", session_label, e);
                break;
            }
        }
    }

    deps.registry.unregister(session.subject.as_str(), connection_id);
    deps.sessions.remove(connection_id);
}

/// Waits for the frame that decides an unbound connection's identity.
///
/// A connect frame carrying a credential verifies it; any other data frame
/// binds the connection anonymously and is returned for processing after
/// the welcome. Returns `None` when the connection ended first.
async fn bind_on_first_frame(
    write: &mut WsWriter,
    read: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    deps: &ConnectionDeps,
    session_label: &str,
) -> Option<(crate::session::SubjectId, Option<ClientFrame>)> {
    loop {
        let msg = match timeout(deps.idle_timeout, read.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("[{}] Connection error before binding: {}", session_label, e);
                return None;
            }
            Ok(None) => {
                debug!("[{}] Closed before binding", session_label);
                return None;
            }
            Err(_) => {
                warn!("[{}] Idle timeout before binding", session_label);
                return None;
            }
        };

        match msg {
            Message::Text(text) => match protocol::decode_client_frame(&text) {
                Ok(ClientFrame::Connect(connect)) => {
                    match deps.authenticator.resolve(connect.credential.as_deref()).await {
                        Ok(subject) => return Some((subject, None)),
                        Err(e) => {
                            warn!("[{}] Connect frame rejected: {}", session_label, e);
                            deps.metrics.handshakes_rejected.inc();
                            send_frame(write, &protocol::create_error(&e)).await;
                            let _ = write.send(Message::Close(None)).await;
                            return None;
                        }
                    }
                }
                Ok(frame) => {
                    // No credential offered: anonymous session, with the
                    // triggering frame handled right after the welcome.
                    match deps.authenticator.resolve(None).await {
                        Ok(subject) => return Some((subject, Some(frame))),
                        Err(e) => {
                            deps.metrics.handshakes_rejected.inc();
                            send_frame(write, &protocol::create_error(&e)).await;
                            let _ = write.send(Message::Close(None)).await;
                            return None;
                        }
                    }
                }
                Err(e) => {
                    debug!("[{}] Undecodable frame before binding: {}", session_label, e);
                    let error = RelayError::InvalidPayload("malformed frame");
                    send_frame(write, &protocol::create_error(&error)).await;
                }
            },
            Message::Ping(data) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Message::Close(_) => {
                debug!("[{}] Closed before binding", session_label);
                return None;
            }
            _ => {
                // Ignore binary, pong, etc.
            }
        }
    }
}

/// Dispatches one decoded client frame against the bound session.
async fn process_frame(
    frame: ClientFrame,
    session: &Session,
    deps: &ConnectionDeps,
    write: &mut WsWriter,
    session_label: &str,
) {
    match frame {
        ClientFrame::Connect(_) => {
            // Identity is write-once per connection: re-acknowledge the
            // bound subject, never re-verify.
            debug!("[{}] Duplicate connect frame", session_label);
            let welcome =
                protocol::create_welcome(session.subject.as_str(), session.is_anonymous());
            send_frame(write, &welcome).await;
        }
        ClientFrame::Chat(chat) => {
            let result = deps
                .relay
                .relay_from_connection(
                    &session.subject,
                    &chat.sender_id,
                    &chat.receiver_id,
                    &chat.body,
                    chat.sender_name.as_deref(),
                )
                .await;
            match result {
                Ok(message) => {
                    debug!("[{}] Relayed message {}", session_label, message.id);
                }
                Err(e) => {
                    debug!("[{}] Chat frame rejected: {}", session_label, e);
                    send_frame(write, &protocol::create_error(&e)).await;
                }
            }
        }
        ClientFrame::Typing(typing) => {
            let result = deps.relay.relay_typing(
                &session.subject,
                &typing.sender_id,
                &typing.receiver_id,
                typing.is_typing,
            );
            if let Err(e) = result {
                debug!("[{}] Typing frame rejected: {}", session_label, e);
                send_frame(write, &protocol::create_error(&e)).await;
            }
        }
        ClientFrame::Presence(presence) => {
            let result =
                deps.relay
                    .publish_status(&session.subject, &presence.user_id, &presence.status);
            if let Err(e) = result {
                debug!("[{}] Presence frame rejected: {}", session_label, e);
                send_frame(write, &protocol::create_error(&e)).await;
            }
        }
        ClientFrame::Join(join) => {
            let result = deps
                .relay
                .publish_join(&session.subject, &join.user_id, &join.action);
            if let Err(e) = result {
                debug!("[{}] Join frame rejected: {}", session_label, e);
                send_frame(write, &protocol::create_error(&e)).await;
            }
        }
        ClientFrame::Subscribe(request) => {
            if deps.registry.subscribe(&request.topic, session.connection_id) {
                debug!("[{}] Subscribed to {}", session_label, request.topic);
            } else {
                warn!("[{}] Subscribe without registration", session_label);
            }
        }
        ClientFrame::Unsubscribe(request) => {
            deps.registry.unsubscribe(&request.topic, session.connection_id);
            debug!("[{}] Unsubscribed from {}", session_label, request.topic);
        }
        ClientFrame::Unknown => {
            // Tolerated for forward compatibility.
            debug!("[{}] Unknown frame type", session_label);
        }
    }
}
