//! Test utilities shared by the integration suites.
//!
//! Provides an in-memory SQLite database with migrations applied, a
//! configuration pointing every provider at a mock server, webhook signing
//! helpers and a fully wired pipeline.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use hmac::{Hmac, Mac};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use sha2::Sha256;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skill_sync::config::{AppConfig, DispatchConfig, RateLimitPolicyConfig, SyncConfig};
use skill_sync::domain::{Connection, Credential, OwnerId, Provider};
use skill_sync::providers::ProviderRegistry;
use skill_sync::server::AppState;

pub const OPERATOR_TOKEN: &str = "operator-test-token";
pub const GITHUB_SECRET: &str = "github-webhook-secret";
pub const GENERIC_SECRET: &str = "generic-webhook-secret";
pub const SLACK_SECRET: &str = "slack-signing-secret";
pub const JIRA_SECRET: &str = "jira-webhook-secret";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Configuration with every provider API (and token endpoint) at `api_base`,
/// all webhook secrets set and backoff delays disabled.
pub fn test_config(api_base: &str) -> AppConfig {
    AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7; 32]),
        github_client_id: Some("gh-client".to_string()),
        github_client_secret: Some("gh-client-secret".to_string()),
        github_oauth_base: api_base.to_string(),
        github_api_base: api_base.to_string(),
        webhook_github_secret: Some(GITHUB_SECRET.to_string()),
        jira_api_base: api_base.to_string(),
        jira_oauth_base: api_base.to_string(),
        webhook_jira_secret: Some(JIRA_SECRET.to_string()),
        slack_api_base: api_base.to_string(),
        webhook_slack_signing_secret: Some(SLACK_SECRET.to_string()),
        oauth_client_id: Some("feed-client".to_string()),
        oauth_client_secret: Some("feed-client-secret".to_string()),
        oauth_api_base: Some(api_base.to_string()),
        oauth_token_url: Some(format!("{api_base}/oauth/token")),
        webhook_oauth_secret: Some(GENERIC_SECRET.to_string()),
        rate_limit_policy: RateLimitPolicyConfig {
            base_seconds: 0,
            max_seconds: 0,
            jitter_factor: 0.0,
            max_retries: 2,
            provider_overrides: Default::default(),
        },
        sync: SyncConfig {
            lease_ttl_seconds: 60,
            page_size: 50,
        },
        dispatch: DispatchConfig {
            wait_ms: 2_000,
            sweep_interval_seconds: 3_600,
            ..DispatchConfig::default()
        },
        ..AppConfig::default()
    }
}

/// `sha256=<hex>` HMAC signature as GitHub and the generic feed send it.
pub fn sha256_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Slack v0 signature over `v0:{timestamp}:{body}`.
pub fn slack_signature(secret: &str, timestamp: u64, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// The SeaORM-backed pipeline with its dispatcher lanes running.
pub struct TestPipeline {
    pub state: AppState,
    pub shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TestPipeline {
    pub async fn start(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let db = setup_test_db().await?;
        let providers = ProviderRegistry::from_config(&config)?;
        let shutdown = CancellationToken::new();
        let (state, workers) = AppState::build(config, db, providers, shutdown.clone())?;
        Ok(Self {
            state,
            shutdown,
            workers,
        })
    }

    /// Connects `owner_id` to `provider` with a long-lived credential.
    pub async fn connect(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        account: &str,
    ) -> Result<Connection> {
        let credential = Credential::new(format!("{}-access", provider.slug()))
            .with_refresh_token(format!("{}-refresh", provider.slug()))
            .with_expiry(chrono::Utc::now() + chrono::Duration::days(30));
        Ok(self
            .state
            .connections
            .connect(owner_id, provider, account, credential)
            .await?)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
