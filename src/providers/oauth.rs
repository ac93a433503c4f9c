//! OAuth2 `refresh_token` grant shared by every adapter.

use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{Credential, Provider};
use crate::providers::ProviderError;
use crate::providers::http::{BackoffPolicy, send_with_retry};

/// Client registration used to refresh tokens at one token endpoint.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_url", &self.token_url)
            .finish()
    }
}

impl OAuthClientConfig {
    /// Pairs an optional id/secret with a token URL; `None` when either is missing.
    pub fn from_parts(
        client_id: Option<&String>,
        client_secret: Option<&String>,
        token_url: impl Into<String>,
    ) -> Option<Self> {
        Some(Self {
            client_id: client_id?.clone(),
            client_secret: client_secret?.clone(),
            token_url: token_url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    /// Slack wraps every response in `ok`
    ok: Option<bool>,
    error: Option<String>,
    error_description: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Exchanges `credential.refresh_token` at the configured token endpoint.
///
/// Providers that do not rotate refresh tokens omit one in the response; the
/// existing refresh token is kept in that case.
pub async fn refresh_grant(
    http: &reqwest::Client,
    provider: Provider,
    client: Option<&OAuthClientConfig>,
    policy: &BackoffPolicy,
    credential: &Credential,
) -> Result<Credential, ProviderError> {
    let client = client.ok_or_else(|| {
        ProviderError::Configuration(format!("{provider} OAuth client is not configured"))
    })?;
    let refresh_token = credential
        .refresh_token
        .as_deref()
        .ok_or_else(|| ProviderError::Auth("credential has no refresh token".to_string()))?;

    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
    ];

    let response = send_with_retry(policy, provider, || {
        http.post(&client.token_url)
            .header("Accept", "application/json")
            .form(&form)
    })
    .await
    .map_err(|error| match error {
        // Token endpoints answer an invalid grant with 400.
        ProviderError::Upstream {
            status: Some(400), ..
        } => ProviderError::Auth(format!("refresh rejected: {error}")),
        other => other,
    })?;

    let body: TokenResponse = response.json().await?;
    if body.ok == Some(false) || body.error.is_some() {
        let reason = body
            .error_description
            .or(body.error)
            .unwrap_or_else(|| "unknown error".to_string());
        warn!(provider = %provider, reason = %reason, "Token refresh rejected");
        return Err(ProviderError::Auth(format!("refresh rejected: {reason}")));
    }

    let access_token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProviderError::validation("token response has no access_token"))?;

    let scopes = body
        .scope
        .map(|s| {
            s.split([' ', ','])
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| credential.scopes.clone());

    info!(provider = %provider, "Refreshed access token");

    Ok(Credential {
        access_token,
        refresh_token: body.refresh_token.or_else(|| credential.refresh_token.clone()),
        expires_at: body
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs)),
        scopes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(StdDuration::from_millis(1), StdDuration::from_millis(2), 0.0, 1)
    }

    fn client(server: &MockServer) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            token_url: format!("{}/oauth/token", server.uri()),
        }
    }

    #[tokio::test]
    async fn refresh_returns_new_credential_and_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a2",
                "expires_in": 3600,
                "scope": "read:jira-work offline_access"
            })))
            .mount(&server)
            .await;

        let old = Credential::new("a1").with_refresh_token("r1");
        let fresh = refresh_grant(
            &reqwest::Client::new(),
            Provider::Jira,
            Some(&client(&server)),
            &policy(),
            &old,
        )
        .await
        .unwrap();

        assert_eq!(fresh.access_token, "a2");
        assert_eq!(fresh.refresh_token.as_deref(), Some("r1"));
        assert!(fresh.expires_at.unwrap() > Utc::now());
        assert_eq!(fresh.scopes, vec!["read:jira-work", "offline_access"]);
    }

    #[tokio::test]
    async fn invalid_grant_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let old = Credential::new("a1").with_refresh_token("r1");
        let err = refresh_grant(
            &reqwest::Client::new(),
            Provider::Github,
            Some(&client(&server)),
            &policy(),
            &old,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn slack_style_ok_false_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "invalid_refresh_token"})),
            )
            .mount(&server)
            .await;

        let old = Credential::new("a1").with_refresh_token("r1");
        let err = refresh_grant(
            &reqwest::Client::new(),
            Provider::Slack,
            Some(&client(&server)),
            &policy(),
            &old,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn missing_client_or_refresh_token() {
        let old = Credential::new("a1");
        let err = refresh_grant(&reqwest::Client::new(), Provider::Github, None, &policy(), &old)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));

        let server = MockServer::start().await;
        let err = refresh_grant(
            &reqwest::Client::new(),
            Provider::Github,
            Some(&client(&server)),
            &policy(),
            &old,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }
}
