//! Normalized provider activity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{OwnerId, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    CodeChange,
    Issue,
    Message,
    LanguageUsage,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::CodeChange => "code-change",
            ActivityKind::Issue => "issue",
            ActivityKind::Message => "message",
            ActivityKind::LanguageUsage => "language-usage",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of provider evidence attributed to an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub owner_id: OwnerId,
    pub provider: Provider,
    pub kind: ActivityKind,
    /// Provider identity of the underlying record (commit sha, issue key, message ts).
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    /// Repository, project or channel the activity belongs to.
    pub subject: String,
    pub attributes: Value,
}

impl Activity {
    /// Stable identity used to make sure an activity feeds evidence exactly once.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider.slug(),
            self.kind.as_str(),
            self.external_id
        )
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// An activity normalized from a webhook payload before the owner is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDraft {
    pub provider: Provider,
    pub kind: ActivityKind,
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub subject: String,
    /// Provider account id of the actor, used to resolve the owning connection.
    pub actor_account_id: String,
    pub attributes: Value,
}

impl ActivityDraft {
    pub fn attribute_to(self, owner_id: OwnerId) -> Activity {
        Activity {
            owner_id,
            provider: self.provider,
            kind: self.kind,
            external_id: self.external_id,
            occurred_at: self.occurred_at,
            subject: self.subject,
            attributes: self.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_combines_provider_kind_and_external_id() {
        let activity = Activity {
            owner_id: OwnerId::new(),
            provider: Provider::Github,
            kind: ActivityKind::CodeChange,
            external_id: "abc123".into(),
            occurred_at: Utc::now(),
            subject: "org/repo".into(),
            attributes: json!({}),
        };
        assert_eq!(activity.key(), "github:code-change:abc123");
    }
}
