//! Provider registry
//!
//! Maps each [`Provider`] to its adapter. Built once at startup from
//! [`AppConfig`] and shared through `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::Provider;
use crate::providers::{
    BackoffPolicy, GenericOAuthAdapter, GithubAdapter, JiraAdapter, OAuthClientConfig,
    ProviderAdapter, ProviderMetadata, SlackAdapter,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider '{provider}' is not registered")]
    ProviderNotFound { provider: Provider },
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` under the provider it reports, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, RegistryError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::ProviderNotFound { provider })
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    /// Metadata for every registered provider, ordered by slug.
    pub fn metadata(&self) -> Vec<ProviderMetadata> {
        let mut all: Vec<ProviderMetadata> = self.adapters.values().map(|a| a.metadata()).collect();
        all.sort_by(|a, b| a.provider.slug().cmp(b.provider.slug()));
        all
    }

    /// Builds the production registry. The generic OAuth feed is only
    /// registered when its API base is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(crate::providers::trait_::USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        let policy = |provider| BackoffPolicy::from_config(&config.rate_limit_policy, provider);
        let page_size = config.sync.page_size;

        let mut registry = Self::new();

        registry.register(Arc::new(GithubAdapter::new(
            http.clone(),
            config.github_api_base.clone(),
            OAuthClientConfig::from_parts(
                config.github_client_id.as_ref(),
                config.github_client_secret.as_ref(),
                format!(
                    "{}/login/oauth/access_token",
                    config.github_oauth_base.trim_end_matches('/')
                ),
            ),
            policy(Provider::Github),
            page_size,
        )));

        registry.register(Arc::new(JiraAdapter::new(
            http.clone(),
            config.jira_api_base.clone(),
            OAuthClientConfig::from_parts(
                config.jira_client_id.as_ref(),
                config.jira_client_secret.as_ref(),
                format!("{}/oauth/token", config.jira_oauth_base.trim_end_matches('/')),
            ),
            policy(Provider::Jira),
            page_size,
        )));

        registry.register(Arc::new(SlackAdapter::new(
            http.clone(),
            config.slack_api_base.clone(),
            OAuthClientConfig::from_parts(
                config.slack_client_id.as_ref(),
                config.slack_client_secret.as_ref(),
                format!("{}/oauth.v2.access", config.slack_api_base.trim_end_matches('/')),
            ),
            policy(Provider::Slack),
            page_size,
            config.webhook_slack_tolerance_seconds,
        )));

        if config.oauth_api_base.is_some() {
            let oauth = config.oauth_token_url.as_ref().and_then(|token_url| {
                OAuthClientConfig::from_parts(
                    config.oauth_client_id.as_ref(),
                    config.oauth_client_secret.as_ref(),
                    token_url.clone(),
                )
            });
            registry.register(Arc::new(GenericOAuthAdapter::new(
                http,
                config.oauth_api_base.clone(),
                oauth,
                policy(Provider::GenericOAuth),
                page_size,
            )));
        } else {
            warn!("Generic OAuth provider not registered: SKILLSYNC_OAUTH_API_BASE is not set");
        }

        for provider in Provider::ALL {
            if registry.contains(provider) && config.webhook_secret(provider).is_none() {
                warn!(provider = %provider, "No webhook secret configured; deliveries will be rejected");
            }
        }
        info!(providers = registry.adapters.len(), "Provider registry initialized");

        Ok(registry)
    }
}
