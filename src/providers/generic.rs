//! Generic OAuth2 activity feed
//!
//! For providers that expose activity in the service's own format:
//! `GET {base}/activities?cursor&limit` returning
//! `{activities, next_cursor, has_more}` and `activity.created` webhooks
//! embedding one activity.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::http::{BackoffPolicy, send_with_retry};
use super::oauth::{OAuthClientConfig, refresh_grant};
use super::{
    ActivityPage, AuthenticatedClient, ProviderAdapter, ProviderError, ProviderMetadata,
    SignatureScheme, endpoint, require, str_at,
};
use crate::domain::{
    Activity, ActivityDraft, ActivityKind, Connection, Credential, Cursor, Provider,
    WebhookEnvelope,
};
use crate::webhook_verification::{header_str, verify_sha256_signature};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Clone)]
pub struct GenericOAuthAdapter {
    http: reqwest::Client,
    api_base: Option<String>,
    oauth: Option<OAuthClientConfig>,
    policy: BackoffPolicy,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct FeedActivity {
    id: String,
    kind: ActivityKind,
    occurred_at: DateTime<Utc>,
    subject: String,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    attributes: Value,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    activities: Vec<FeedActivity>,
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

impl GenericOAuthAdapter {
    pub fn new(
        http: reqwest::Client,
        api_base: Option<String>,
        oauth: Option<OAuthClientConfig>,
        policy: BackoffPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            api_base,
            oauth,
            policy,
            page_size,
        }
    }
}

#[async_trait]
impl ProviderAdapter for GenericOAuthAdapter {
    fn provider(&self) -> Provider {
        Provider::GenericOAuth
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(
            Provider::GenericOAuth,
            "Generic OAuth",
            &["activity:read"],
            SignatureScheme::HmacSha256,
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
            Provider::GenericOAuth,
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
        let base = self.api_base.as_deref().ok_or_else(|| {
            ProviderError::Configuration("generic OAuth API base is not configured".to_string())
        })?;

        let mut url = endpoint(Provider::GenericOAuth, base, "/activities")?;
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.to_string());
        if let Some(token) = cursor.and_then(Cursor::as_str) {
            url.query_pairs_mut().append_pair("cursor", token);
        }

        let response =
            send_with_retry(&self.policy, Provider::GenericOAuth, || client.get(url.clone()))
                .await?;
        let page: FeedPage = response.json().await?;

        let activities = page
            .activities
            .into_iter()
            .map(|item| Activity {
                owner_id: client.owner_id,
                provider: Provider::GenericOAuth,
                kind: item.kind,
                external_id: item.id,
                occurred_at: item.occurred_at,
                subject: item.subject,
                attributes: item.attributes,
            })
            .collect();

        // The final page keeps the cursor it was read with.
        let next_cursor = match (page.has_more, page.next_cursor) {
            (true, Some(next)) => Some(Cursor::from_string(next)),
            (true, None) => {
                return Err(ProviderError::validation(
                    "feed reported more pages without a next_cursor",
                ));
            }
            (false, _) => cursor.cloned(),
        };

        Ok(ActivityPage {
            activities,
            next_cursor,
            has_more: page.has_more,
        })
    }

    fn webhook_envelope(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<WebhookEnvelope, ProviderError> {
        let delivery_id = require(header_str(headers, "x-webhook-id"), "X-Webhook-Id")?;
        let event_type = require(str_at(payload, "/type"), "type")?;
        Ok(WebhookEnvelope {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            action: None,
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        verify_sha256_signature(raw_body, headers, SIGNATURE_HEADER, secret)
            .inspect_err(|error| debug!(error = %error, "Generic webhook signature rejected"))
            .is_ok()
    }

    fn normalize_webhook_payload(
        &self,
        envelope: &WebhookEnvelope,
        payload: &Value,
    ) -> Result<Option<ActivityDraft>, ProviderError> {
        if envelope.event_type != "activity.created" {
            return Ok(None);
        }
        let raw = require(payload.get("activity").cloned(), "activity")?;
        let item: FeedActivity = serde_json::from_value(raw)
            .map_err(|e| ProviderError::validation(format!("malformed activity: {e}")))?;
        let actor = require(item.actor_id, "activity actor_id")?;

        Ok(Some(ActivityDraft {
            provider: Provider::GenericOAuth,
            kind: item.kind,
            external_id: item.id,
            occurred_at: item.occurred_at,
            subject: item.subject,
            actor_account_id: actor,
            attributes: item.attributes,
        }))
    }
}
