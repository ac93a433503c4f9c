//! Slack adapter
//!
//! Backfill searches the user's own messages with `search.messages`. Webhooks
//! arrive through the Events API as `event_callback` envelopes.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::http::{BackoffPolicy, send_with_retry};
use super::oauth::{OAuthClientConfig, refresh_grant};
use super::{
    ActivityPage, AuthenticatedClient, ProviderAdapter, ProviderError, ProviderMetadata,
    SignatureScheme, endpoint, parse_timestamp, require, str_at,
};
use crate::domain::{
    Activity, ActivityDraft, ActivityKind, Connection, Credential, Cursor, Provider,
    WebhookEnvelope,
};
use crate::webhook_verification::{unix_now, verify_slack_signature};

#[derive(Debug, Clone)]
pub struct SlackAdapter {
    http: reqwest::Client,
    api_base: String,
    oauth: Option<OAuthClientConfig>,
    policy: BackoffPolicy,
    page_size: u32,
    tolerance_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    ok: bool,
    error: Option<String>,
    messages: Option<SearchMessages>,
}

#[derive(Debug, Deserialize)]
struct SearchMessages {
    #[serde(default)]
    matches: Vec<Value>,
    paging: Paging,
}

#[derive(Debug, Deserialize)]
struct Paging {
    page: u64,
    pages: u64,
}

/// Slack reports failures as `200 {"ok": false, "error": ...}`.
fn api_error(code: &str) -> ProviderError {
    match code {
        "invalid_auth" | "not_authed" | "token_revoked" | "token_expired" | "account_inactive" => {
            ProviderError::Auth(format!("slack: {code}"))
        }
        "ratelimited" => ProviderError::RateLimited {
            retry_after_secs: None,
        },
        other => ProviderError::upstream(Some(200), format!("slack: {other}"), false),
    }
}

impl SlackAdapter {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        oauth: Option<OAuthClientConfig>,
        policy: BackoffPolicy,
        page_size: u32,
        tolerance_seconds: u64,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            oauth,
            policy,
            page_size,
            tolerance_seconds,
        }
    }
}

#[async_trait]
impl ProviderAdapter for SlackAdapter {
    fn provider(&self) -> Provider {
        Provider::Slack
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(
            Provider::Slack,
            "Slack",
            &["search:read", "channels:history"],
            SignatureScheme::SlackV0,
        )
    }

    async fn authenticate(
        &self,
        connection: &Connection,
    ) -> Result<AuthenticatedClient, ProviderError> {
        AuthenticatedClient::for_connection(connection, self.http.clone())
    }

    async fn refresh_credential(
        &self,
        credential: &Credential,
    ) -> Result<Credential, ProviderError> {
        refresh_grant(
            &self.http,
            Provider::Slack,
            self.oauth.as_ref(),
            &self.policy,
            credential,
        )
        .await
    }

    async fn list_activity_since(
        &self,
        client: &AuthenticatedClient,
        cursor: Option<&Cursor>,
    ) -> Result<ActivityPage, ProviderError> {
        let page = cursor.and_then(|c| c.u64_field("page")).unwrap_or(1).max(1);

        let mut url = endpoint(Provider::Slack, &self.api_base, "/search.messages")?;
        url.query_pairs_mut()
            .append_pair("query", &format!("from:<@{}>", client.external_account_id))
            .append_pair("sort", "timestamp")
            .append_pair("sort_dir", "asc")
            .append_pair("count", &self.page_size.to_string())
            .append_pair("page", &page.to_string());

        let response = send_with_retry(&self.policy, Provider::Slack, || client.get(url.clone()))
            .await?;
        let body: SearchResponse = response.json().await?;
        if !body.ok {
            return Err(api_error(body.error.as_deref().unwrap_or("unknown_error")));
        }
        let messages = require(body.messages, "messages")?;

        let mut activities = Vec::with_capacity(messages.matches.len());
        for message in &messages.matches {
            let (Some(channel), Some(ts)) =
                (str_at(message, "/channel/id"), str_at(message, "/ts"))
            else {
                warn!(iid = ?message.get("iid"), "Skipping Slack message without channel or ts");
                continue;
            };
            activities.push(Activity {
                owner_id: client.owner_id,
                provider: Provider::Slack,
                kind: ActivityKind::Message,
                external_id: format!("{channel}:{ts}"),
                occurred_at: parse_timestamp(&json!(ts)).unwrap_or_else(Utc::now),
                subject: channel.to_string(),
                attributes: json!({
                    "channel": channel,
                    "channel_name": str_at(message, "/channel/name"),
                    "text_length": str_at(message, "/text").map(str::len).unwrap_or(0),
                }),
            });
        }

        let has_more = messages.paging.page < messages.paging.pages;
        let next_page = if has_more { page + 1 } else { page };
        Ok(ActivityPage {
            activities,
            next_cursor: Some(Cursor::from_json(json!({ "page": next_page }))),
            has_more,
        })
    }

    fn webhook_envelope(
        &self,
        _headers: &HeaderMap,
        payload: &Value,
    ) -> Result<WebhookEnvelope, ProviderError> {
        let delivery_id = require(str_at(payload, "/event_id"), "event_id")?;
        let event_type = require(str_at(payload, "/type"), "type")?;
        Ok(WebhookEnvelope {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            action: str_at(payload, "/event/type").map(str::to_string),
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        verify_slack_signature(raw_body, headers, secret, self.tolerance_seconds, unix_now())
            .inspect_err(|error| debug!(error = %error, "Slack signature rejected"))
            .is_ok()
    }

    fn normalize_webhook_payload(
        &self,
        envelope: &WebhookEnvelope,
        payload: &Value,
    ) -> Result<Option<ActivityDraft>, ProviderError> {
        if envelope.event_type != "event_callback" {
            return Ok(None);
        }
        let event = require(payload.get("event").filter(|e| e.is_object()), "event")?;
        if str_at(event, "/type") != Some("message") {
            return Ok(None);
        }
        // Edits, joins and bot posts are not the user's own messages.
        if event.get("subtype").is_some() || event.get("bot_id").is_some() {
            return Ok(None);
        }

        let user = require(str_at(event, "/user"), "event user")?;
        let channel = require(str_at(event, "/channel"), "event channel")?;
        let ts = require(str_at(event, "/ts"), "event ts")?;

        Ok(Some(ActivityDraft {
            provider: Provider::Slack,
            kind: ActivityKind::Message,
            external_id: format!("{channel}:{ts}"),
            occurred_at: parse_timestamp(&json!(ts)).unwrap_or_else(Utc::now),
            subject: channel.to_string(),
            actor_account_id: user.to_string(),
            attributes: json!({
                "channel": channel,
                "channel_type": str_at(event, "/channel_type"),
                "text_length": str_at(event, "/text").map(str::len).unwrap_or(0),
            }),
        }))
    }
}
