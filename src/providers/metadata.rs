//! Provider metadata types

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::Provider;

/// How a provider authenticates inbound webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// `sha256=<hex>` HMAC of the raw body
    HmacSha256,
    /// Slack v0 HMAC over `v0:{timestamp}:{body}`
    SlackV0,
    /// Shared secret in `Authorization: Bearer`
    BearerSecret,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderMetadata {
    #[schema(value_type = String, example = "github")]
    pub provider: Provider,
    pub display_name: String,
    /// OAuth scopes the backfill listing needs
    pub scopes: Vec<String>,
    pub webhooks: bool,
    pub signature_scheme: SignatureScheme,
}

impl ProviderMetadata {
    pub fn new(
        provider: Provider,
        display_name: &str,
        scopes: &[&str],
        signature_scheme: SignatureScheme,
    ) -> Self {
        Self {
            provider,
            display_name: display_name.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            webhooks: true,
            signature_scheme,
        }
    }
}
