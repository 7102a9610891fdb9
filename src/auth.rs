//! Authentication
//!
//! Credential verification against the external identity provider, the
//! `AuthPolicy` governing every fallback decision, and the connection
//! authenticator shared by the WebSocket handshake, the `Connect` control
//! frame, and the per-request HTTP ingress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Uri};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::session::SubjectId;

/// Secondary custom credential header checked after the bearer header and
/// the query parameter.
pub const CREDENTIAL_HEADER: &str = "x-auth-token";

/// Policy applied at every authentication decision point: a handshake with
/// no credential, a credential that fails verification, and a frame whose
/// declared sender does not match the bound session. One knob, evaluated
/// identically everywhere, so the relay cannot end up half-permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPolicy {
    /// Refuse unauthenticated connections and mismatched frames.
    /// Production default.
    #[default]
    Reject,
    /// Bind a generated anonymous subject instead of refusing, and let
    /// mismatched frames through with a warning. Development posture.
    AllowAnonymous,
}

/// Verifies an opaque bearer credential with the identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Returns the verified subject for `credential`. Every failure mode,
    /// including an unreachable provider, maps to `InvalidCredential`; the
    /// relay never crashes because the authority is down.
    async fn verify(&self, credential: &str) -> Result<SubjectId, RelayError>;
}

/// Token verifier backed by an HTTP identity endpoint.
///
/// POSTs `{"token": "<credential>"}` and expects a JSON object carrying the
/// subject id in a `uid` or `userId` field.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenVerifier {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        HttpTokenVerifier { client, endpoint }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<SubjectId, RelayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "token": credential }))
            .send()
            .await
            .map_err(|e| {
                debug!("identity provider unreachable: {}", e);
                RelayError::InvalidCredential
            })?;

        if !response.status().is_success() {
            debug!(
                "identity provider rejected credential: {}",
                response.status()
            );
            return Err(RelayError::InvalidCredential);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| RelayError::InvalidCredential)?;

        body.get("uid")
            .or_else(|| body.get("userId"))
            .and_then(|v| v.as_str())
            .map(SubjectId::new)
            .ok_or(RelayError::InvalidCredential)
    }
}

/// Fixed token table for development and tests.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, credential: &str, subject: &str) -> Self {
        self.tokens
            .insert(credential.to_string(), subject.to_string());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<SubjectId, RelayError> {
        self.tokens
            .get(credential)
            .map(SubjectId::new)
            .ok_or(RelayError::InvalidCredential)
    }
}

/// Extracts a credential from an upgrade or API request. Carriers in
/// priority order, first present wins: `Authorization: Bearer`, the `token`
/// query parameter, the `X-Auth-Token` header.
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    if let Some(query) = uri.query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Authentication decision points for connections and per-request ingress.
/// Holds the verifier and the policy; all callers resolve identities and
/// authorize senders through here so the posture stays uniform.
pub struct ConnectionAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    policy: AuthPolicy,
}

impl ConnectionAuthenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, policy: AuthPolicy) -> Self {
        ConnectionAuthenticator { verifier, policy }
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Resolves an optional credential into a subject. `Ok` carries the
    /// verified subject or an anonymous fallback; `Err` means the caller
    /// must refuse the connection, frame, or request.
    pub async fn resolve(&self, credential: Option<&str>) -> Result<SubjectId, RelayError> {
        match credential {
            Some(token) => match self.verifier.verify(token).await {
                Ok(subject) => Ok(subject),
                Err(_) if self.policy == AuthPolicy::AllowAnonymous => {
                    debug!("credential failed verification, binding anonymous subject");
                    Ok(SubjectId::anonymous())
                }
                Err(_) => Err(RelayError::AuthRejected(
                    "credential rejected".to_string(),
                )),
            },
            None => match self.policy {
                AuthPolicy::AllowAnonymous => Ok(SubjectId::anonymous()),
                AuthPolicy::Reject => Err(RelayError::AuthRejected(
                    "no credential presented".to_string(),
                )),
            },
        }
    }

    /// Per-message authorization: the declared sender must match the bound
    /// session subject.
    pub fn authorize_sender(&self, bound: &SubjectId, declared: &str) -> Result<(), RelayError> {
        if bound.as_str() == declared {
            return Ok(());
        }
        match self.policy {
            AuthPolicy::AllowAnonymous => {
                warn!("frame sender does not match session identity, allowed by policy");
                debug!(bound = %bound, declared, "sender mismatch detail");
                Ok(())
            }
            AuthPolicy::Reject => Err(RelayError::AuthRejected(
                "declared sender does not match session identity".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator(policy: AuthPolicy) -> ConnectionAuthenticator {
        let verifier = StaticTokenVerifier::new().with_token("good-token", "u1");
        ConnectionAuthenticator::new(Arc::new(verifier), policy)
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticTokenVerifier::new().with_token("tok", "alice");
        assert_eq!(verifier.verify("tok").await.unwrap().as_str(), "alice");
        assert!(matches!(
            verifier.verify("wrong").await,
            Err(RelayError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn test_resolve_verified_subject() {
        for policy in [AuthPolicy::Reject, AuthPolicy::AllowAnonymous] {
            let subject = authenticator(policy)
                .resolve(Some("good-token"))
                .await
                .unwrap();
            assert_eq!(subject.as_str(), "u1");
            assert!(!subject.is_anonymous());
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_credential_rejected() {
        let result = authenticator(AuthPolicy::Reject).resolve(None).await;
        assert!(matches!(result, Err(RelayError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_resolve_missing_credential_anonymous() {
        let subject = authenticator(AuthPolicy::AllowAnonymous)
            .resolve(None)
            .await
            .unwrap();
        assert!(subject.is_anonymous());
    }

    #[tokio::test]
    async fn test_resolve_bad_credential_per_policy() {
        let rejected = authenticator(AuthPolicy::Reject)
            .resolve(Some("bad-token"))
            .await;
        assert!(matches!(rejected, Err(RelayError::AuthRejected(_))));

        let fallback = authenticator(AuthPolicy::AllowAnonymous)
            .resolve(Some("bad-token"))
            .await
            .unwrap();
        assert!(fallback.is_anonymous());
    }

    #[tokio::test]
    async fn test_authorize_sender_match() {
        let auth = authenticator(AuthPolicy::Reject);
        assert!(auth
            .authorize_sender(&SubjectId::new("u1"), "u1")
            .is_ok());
    }

    #[tokio::test]
    async fn test_authorize_sender_mismatch_per_policy() {
        let rejected =
            authenticator(AuthPolicy::Reject).authorize_sender(&SubjectId::new("u1"), "u2");
        assert!(matches!(rejected, Err(RelayError::AuthRejected(_))));

        let allowed = authenticator(AuthPolicy::AllowAnonymous)
            .authorize_sender(&SubjectId::new("u1"), "u2");
        assert!(allowed.is_ok());
    }

    #[test]
    fn test_extract_credential_priority() {
        let uri: Uri = "/ws?token=from-query".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        headers.insert(CREDENTIAL_HEADER, "from-custom".parse().unwrap());

        // All three present: the bearer header wins.
        assert_eq!(
            extract_credential(&headers, &uri).as_deref(),
            Some("from-bearer")
        );

        headers.remove(header::AUTHORIZATION);
        assert_eq!(
            extract_credential(&headers, &uri).as_deref(),
            Some("from-query")
        );

        let bare: Uri = "/ws".parse().unwrap();
        assert_eq!(
            extract_credential(&headers, &bare).as_deref(),
            Some("from-custom")
        );

        headers.remove(CREDENTIAL_HEADER);
        assert_eq!(extract_credential(&headers, &bare), None);
    }

    #[test]
    fn test_extract_credential_ignores_non_bearer_auth() {
        let uri: Uri = "/ws".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic dXNlcjpwdw==".parse().unwrap());
        assert_eq!(extract_credential(&headers, &uri), None);
    }
}
