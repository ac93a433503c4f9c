//! Core domain types shared by every stage of the pipeline.
//!
//! Nothing in here performs I/O. Stores, adapters and the inference engine all
//! exchange these values.

pub mod activity;
pub mod connection;
pub mod skill;
pub mod webhook;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub use activity::{Activity, ActivityDraft, ActivityKind};
pub use connection::{Connection, ConnectionStatus, Credential};
pub use skill::{
    EvidenceEntry, SkillCategory, SkillEvidence, SkillLevel, SkillRecord, SkillSource,
};
pub use webhook::{WebhookEnvelope, WebhookEvent};

/// Identifier of the internal identity (employee or company) that owns a connection.
///
/// Connections and skill records hold this identifier only, never a handle to the
/// owning record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
#[schema(value_type = String, format = "uuid")]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OwnerId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// External activity source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum Provider {
    /// Source-code hosting.
    #[serde(rename = "github")]
    Github,
    /// Issue tracker.
    #[serde(rename = "jira")]
    Jira,
    /// Team messaging.
    #[serde(rename = "slack")]
    Slack,
    /// Generic OAuth2 activity feed.
    #[serde(rename = "oauth")]
    GenericOAuth,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Github,
        Provider::Jira,
        Provider::Slack,
        Provider::GenericOAuth,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Jira => "jira",
            Provider::Slack => "slack",
            Provider::GenericOAuth => "oauth",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.slug().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Opaque, provider-defined resume token for activity listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct Cursor(pub serde_json::Value);

impl Cursor {
    pub fn from_json(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(serde_json::Value::String(value.into()))
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Reads an unsigned integer field from an object cursor, e.g. `{"page": 3}`.
    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.0.get(field).and_then(serde_json::Value::as_u64)
    }
}

impl From<serde_json::Value> for Cursor {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}
