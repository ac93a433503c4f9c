//! Provider adapter trait definition
//!
//! Every activity source sits behind [`ProviderAdapter`]. Adapters own their
//! HTTP details (pagination, rate limits, webhook formats) and hand the rest of
//! the pipeline normalized [`Activity`] values.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Activity, ActivityDraft, Connection, Credential, Cursor, OwnerId, Provider, WebhookEnvelope,
};
use crate::providers::metadata::ProviderMetadata;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Credentials were rejected or are unusable; refreshing may help once.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by provider{}", retry_after_suffix(.retry_after_secs))]
    RateLimited { retry_after_secs: Option<u64> },

    /// The payload or response does not have the expected shape.
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("upstream unavailable{}: {message}", status_suffix(.status))]
    Upstream {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("provider not configured: {0}")]
    Configuration(String),
}

fn retry_after_suffix(secs: &Option<u64>) -> String {
    secs.map(|s| format!(" (retry after {s}s)"))
        .unwrap_or_default()
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl ProviderError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProviderError::Validation(message.into())
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>, retryable: bool) -> Self {
        ProviderError::Upstream {
            status,
            message: message.into(),
            retryable,
        }
    }

    /// Whether repeating the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Upstream { retryable, .. } => *retryable,
            ProviderError::Auth(_)
            | ProviderError::Validation(_)
            | ProviderError::Configuration(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return ProviderError::upstream(
                error.status().map(|s| s.as_u16()),
                format!("malformed response: {error}"),
                false,
            );
        }
        ProviderError::upstream(
            error.status().map(|s| s.as_u16()),
            error.to_string(),
            error.is_timeout() || error.is_connect() || error.is_request(),
        )
    }
}

/// An HTTP client bound to one connection's access token.
#[derive(Clone)]
pub struct AuthenticatedClient {
    pub connection_id: Uuid,
    pub owner_id: OwnerId,
    pub provider: Provider,
    pub external_account_id: String,
    access_token: String,
    http: reqwest::Client,
}

impl AuthenticatedClient {
    /// Validates the connection's credential and binds it to `http`.
    pub fn for_connection(
        connection: &Connection,
        http: reqwest::Client,
    ) -> Result<Self, ProviderError> {
        let credential = &connection.credential;
        if credential.access_token.trim().is_empty() {
            return Err(ProviderError::Auth("access token is empty".to_string()));
        }
        if credential.is_expired(Utc::now()) {
            return Err(ProviderError::Auth("access token has expired".to_string()));
        }

        Ok(Self {
            connection_id: connection.id,
            owner_id: connection.owner_id,
            provider: connection.provider,
            external_account_id: connection.external_account_id.clone(),
            access_token: credential.access_token.clone(),
            http,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn get(&self, url: url::Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .bearer_auth(&self.access_token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
    }
}

impl std::fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("connection_id", &self.connection_id)
            .field("provider", &self.provider)
            .field("external_account_id", &self.external_account_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

pub const USER_AGENT: &str = concat!("skill-sync/", env!("CARGO_PKG_VERSION"));

/// One page of backfill results.
#[derive(Debug, Clone, Default)]
pub struct ActivityPage {
    pub activities: Vec<Activity>,
    /// Where the next call should resume. On the final page this points back at
    /// the final page so a later incremental sync picks up appended records.
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn metadata(&self) -> ProviderMetadata;

    /// Builds a client for the connection's current credential. No network call
    /// is made; an unusable credential yields [`ProviderError::Auth`].
    async fn authenticate(
        &self,
        connection: &Connection,
    ) -> Result<AuthenticatedClient, ProviderError>;

    /// Exchanges the refresh token for a new credential.
    async fn refresh_credential(&self, credential: &Credential)
    -> Result<Credential, ProviderError>;

    /// Lists activity after `cursor` (from the beginning when `None`).
    async fn list_activity_since(
        &self,
        client: &AuthenticatedClient,
        cursor: Option<&Cursor>,
    ) -> Result<ActivityPage, ProviderError>;

    /// Extracts the delivery identity of an inbound webhook.
    fn webhook_envelope(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<WebhookEnvelope, ProviderError>;

    fn verify_webhook_signature(&self, raw_body: &[u8], headers: &HeaderMap, secret: &str) -> bool;

    /// `Ok(None)` for events that carry no skill signal.
    fn normalize_webhook_payload(
        &self,
        envelope: &WebhookEnvelope,
        payload: &Value,
    ) -> Result<Option<ActivityDraft>, ProviderError>;
}
