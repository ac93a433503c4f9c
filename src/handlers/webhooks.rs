//! # Webhook Handler
//!
//! Public ingestion endpoint. Authentication is the provider signature, checked
//! by the gateway; the only work done here is rate limiting, Slack's
//! `url_verification` handshake and bounding the response time.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::Value;
use tracing::debug;

use super::types::{SlackChallenge, WebhookAck};
use crate::domain::Provider;
use crate::error::{ApiError, rate_limited};
use crate::server::AppState;
use crate::webhook_gateway::IngestOutcome;
use crate::webhook_verification::unix_now;

/// Accepts a provider webhook
///
/// Responses:
/// - `202`: logged; processing continues in the background if it did not finish in time
/// - `200`: duplicate delivery, or the Slack challenge echo
/// - `400`: malformed payload or missing delivery headers
/// - `401`: signature missing, invalid or not configured
/// - `404`: unknown provider
/// - `429`: per-provider rate limit exceeded
#[utoipa::path(
    post,
    path = "/webhooks/{provider}",
    params(
        ("provider" = String, Path, description = "Provider slug"),
        ("X-Hub-Signature-256" = Option<String>, Header, description = "GitHub HMAC-SHA256 signature"),
        ("X-Webhook-Signature" = Option<String>, Header, description = "Generic OAuth provider HMAC-SHA256 signature"),
        ("X-Slack-Signature" = Option<String>, Header, description = "Slack v0 signature"),
        ("X-Slack-Request-Timestamp" = Option<String>, Header, description = "Slack request timestamp"),
        ("Authorization" = Option<String>, Header, description = "Jira shared webhook secret as a bearer token")
    ),
    request_body(content = Value, description = "Provider payload", content_type = "application/json"),
    responses(
        (status = 202, description = "Webhook accepted", body = WebhookAck),
        (status = 200, description = "Duplicate delivery or Slack challenge", body = WebhookAck),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Signature rejected", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError),
        (status = 429, description = "Rate limit exceeded", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if state.webhook_limiter.is_limited(&provider) {
        debug!(provider = %provider, "Webhook rate limit exceeded");
        return Err(rate_limited(60 - unix_now() % 60));
    }

    if let Some(challenge) = slack_challenge(&provider, &body) {
        state.gateway.verify(&provider, &headers, &body)?;
        return Ok((StatusCode::OK, Json(SlackChallenge { challenge })).into_response());
    }

    let outcome = state.gateway.ingest(&provider, &headers, &body).await?;
    let response = match outcome {
        IngestOutcome::Duplicate => (StatusCode::OK, Json(WebhookAck::duplicate())),
        IngestOutcome::Accepted { event_id, .. } => {
            (StatusCode::ACCEPTED, Json(WebhookAck::accepted(event_id)))
        }
        IngestOutcome::Dispatched { event_id, receipt } => {
            let wait = Duration::from_millis(state.config.dispatch.wait_ms);
            if tokio::time::timeout(wait, receipt).await.is_err() {
                debug!(event_id = %event_id, "Dispatch still running; answering early");
            }
            (StatusCode::ACCEPTED, Json(WebhookAck::accepted(event_id)))
        }
    };
    Ok(response.into_response())
}

/// The challenge string of a Slack `url_verification` request.
fn slack_challenge(provider: &str, body: &[u8]) -> Option<String> {
    if provider.parse::<Provider>().ok()? != Provider::Slack {
        return None;
    }
    let payload: Value = serde_json::from_slice(body).ok()?;
    if payload.get("type")?.as_str()? != "url_verification" {
        return None;
    }
    payload.get("challenge")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_challenge_is_extracted() {
        let body = br#"{"type":"url_verification","challenge":"abc123","token":"x"}"#;
        assert_eq!(slack_challenge("slack", body).as_deref(), Some("abc123"));
    }

    #[test]
    fn challenge_only_applies_to_slack_handshakes() {
        let body = br#"{"type":"url_verification","challenge":"abc123"}"#;
        assert_eq!(slack_challenge("github", body), None);

        let event = br#"{"type":"event_callback","event":{"type":"message"}}"#;
        assert_eq!(slack_challenge("slack", event), None);
        assert_eq!(slack_challenge("slack", b"not json"), None);
    }
}
