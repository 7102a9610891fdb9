//! Relay Error Taxonomy
//!
//! Every failure the relay can produce, with stable machine-readable codes
//! shared by WebSocket error frames and HTTP error bodies. Only the first
//! four variants ever cross a component boundary upward; `DeliveryFailed`
//! and `NotificationFailed` are caught at their call site and exist for
//! dispatch reports and logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The presented credential did not verify against the identity provider.
    /// Covers bad tokens as well as a transiently unreachable provider.
    #[error("credential rejected by identity provider")]
    InvalidCredential,

    /// Handshake, frame, or request refused by the authentication policy.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Frame or request payload failed validation. No state was created.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// The message store refused the write. Fatal to the relay call.
    #[error("persistence failed: {0}")]
    PersistenceFailed(#[from] StoreError),

    /// A single fan-out destination could not be reached. Non-fatal.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// The outbound push notification call failed. Non-fatal.
    #[error("notification failed: {0}")]
    NotificationFailed(String),
}

impl RelayError {
    /// Stable wire code carried in `Error` frames and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidCredential => "INVALID_CREDENTIAL",
            RelayError::AuthRejected(_) => "AUTH_REJECTED",
            RelayError::InvalidPayload(_) => "INVALID_PAYLOAD",
            RelayError::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            RelayError::DeliveryFailed(_) => "DELIVERY_FAILED",
            RelayError::NotificationFailed(_) => "NOTIFICATION_FAILED",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidCredential => StatusCode::UNAUTHORIZED,
            RelayError::AuthRejected(_) => StatusCode::FORBIDDEN,
            RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::PersistenceFailed(_)
            | RelayError::DeliveryFailed(_)
            | RelayError::NotificationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.code(),
            "reason": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(RelayError::InvalidCredential.code(), "INVALID_CREDENTIAL");
        assert_eq!(
            RelayError::AuthRejected("mismatch".into()).code(),
            "AUTH_REJECTED"
        );
        assert_eq!(RelayError::InvalidPayload("empty body").code(), "INVALID_PAYLOAD");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::InvalidCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::AuthRejected("mismatch".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RelayError::InvalidPayload("empty body").status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
