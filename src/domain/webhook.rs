//! Webhook log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Provider;

/// Routing fields every provider payload must yield before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
}

/// One received provider notification. Rows are appended, updated once, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: Provider,
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    /// Subject (repository, project, channel) once the payload has been normalized.
    pub subject: Option<String>,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
    /// False for deliveries whose signature did not verify.
    pub verified: bool,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Whether the background sweep may retry dispatch.
    pub retryable: bool,
    pub attempts: u32,
}

impl WebhookEvent {
    /// A verified, not yet processed delivery.
    pub fn received(provider: Provider, envelope: &WebhookEnvelope, raw_payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            delivery_id: envelope.delivery_id.clone(),
            event_type: envelope.event_type.clone(),
            action: envelope.action.clone(),
            subject: None,
            raw_payload,
            received_at: Utc::now(),
            verified: true,
            processed: false,
            processed_at: None,
            error_message: None,
            retryable: true,
            attempts: 0,
        }
    }

    /// A delivery whose signature check failed. Kept for audit, never dispatched.
    pub fn rejected(
        provider: Provider,
        envelope: &WebhookEnvelope,
        raw_payload: Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            verified: false,
            retryable: false,
            error_message: Some(reason.into()),
            ..Self::received(provider, envelope, raw_payload)
        }
    }
}
