//! Push Notifications
//!
//! Outbound push delivery for receivers who may not be connected. Strictly
//! best-effort: the relay spawns these calls fire-and-forget and a failing
//! or slow push endpoint never delays or fails a message relay.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::RelayError;

/// Push notification boundary. Callers isolate failures; implementations
/// report them as `NotificationFailed` so they can be logged and counted.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Notifies `receiver_id` about a new message from `sender_id`.
    async fn notify(
        &self,
        receiver_id: &str,
        sender_id: &str,
        body: &str,
        sender_display_name: Option<&str>,
    ) -> Result<(), RelayError>;
}

fn build_payload(
    receiver_id: &str,
    sender_id: &str,
    body: &str,
    sender_display_name: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "receiverId": receiver_id,
        "senderId": sender_id,
        "message": body,
        // The push endpoint shows a sender name; fall back to the id.
        "senderName": sender_display_name.unwrap_or(sender_id),
    })
}

/// Sink that POSTs the notification payload to an HTTP push endpoint.
pub struct HttpNotificationSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotificationSink {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        HttpNotificationSink { client, endpoint }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify(
        &self,
        receiver_id: &str,
        sender_id: &str,
        body: &str,
        sender_display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        let payload = build_payload(receiver_id, sender_id, body, sender_display_name);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RelayError::NotificationFailed(e.to_string()))?;

        if response.status().is_success() {
            debug!("push notification accepted");
            Ok(())
        } else {
            Err(RelayError::NotificationFailed(format!(
                "push endpoint returned {}",
                response.status()
            )))
        }
    }
}

/// No-op sink used when no push endpoint is configured.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn notify(
        &self,
        _receiver_id: &str,
        _sender_id: &str,
        _body: &str,
        _sender_display_name: Option<&str>,
    ) -> Result<(), RelayError> {
        Ok(())
    }
}
