//! Request and response bodies shared by the API handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::domain::{Connection, ConnectionStatus, Credential, OwnerId, Provider, SkillRecord};
use crate::providers::ProviderMetadata;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "ok")]
    pub database: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderMetadata>,
}

/// Credential obtained by the caller's OAuth flow.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ConnectRequest {
    #[schema(value_type = String, example = "github")]
    pub provider: Provider,
    /// Provider-side account id (GitHub login, Jira account id, Slack user id)
    #[schema(example = "octocat")]
    pub external_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ConnectRequest {
    pub fn credential(&self) -> Credential {
        let mut credential =
            Credential::new(self.access_token.clone()).with_scopes(self.scopes.clone());
        if let Some(refresh_token) = &self.refresh_token {
            credential = credential.with_refresh_token(refresh_token.clone());
        }
        if let Some(expires_at) = self.expires_at {
            credential = credential.with_expiry(expires_at);
        }
        credential
    }
}

/// Connection as exposed over the API; tokens never leave the service.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    #[schema(value_type = String, format = "uuid")]
    pub id: Uuid,
    pub owner_id: OwnerId,
    #[schema(value_type = String, example = "github")]
    pub provider: Provider,
    pub external_account_id: String,
    pub status: ConnectionStatus,
    pub error_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[schema(default = false, example = true)]
    pub has_refresh_token: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Connection> for ConnectionInfo {
    fn from(connection: &Connection) -> Self {
        Self {
            id: connection.id,
            owner_id: connection.owner_id,
            provider: connection.provider,
            external_account_id: connection.external_account_id.clone(),
            status: connection.status,
            error_reason: connection.error_reason.clone(),
            expires_at: connection.credential.expires_at,
            has_refresh_token: connection.credential.refresh_token.is_some(),
            last_sync_at: connection.last_sync_at,
            created_at: connection.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SyncQuery {
    /// Ignore the stored checkpoint and sync the whole history
    #[serde(default)]
    pub full: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SkillsResponse {
    pub owner_id: OwnerId,
    pub skills: Vec<SkillRecord>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    #[schema(example = "accepted")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub event_id: Option<Uuid>,
}

impl WebhookAck {
    pub fn accepted(event_id: Uuid) -> Self {
        Self {
            status: "accepted".to_string(),
            event_id: Some(event_id),
        }
    }

    pub fn duplicate() -> Self {
        Self {
            status: "duplicate".to_string(),
            event_id: None,
        }
    }
}

/// Answer to Slack's `url_verification` handshake.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SlackChallenge {
    pub challenge: String,
}
