//! Configuration loading for the skill sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SKILLSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::domain::Provider;
use crate::inference::policy;

const ENV_PREFIX: &str = "SKILLSYNC_";

/// Application configuration derived from `SKILLSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_client_secret: Option<String>,
    #[serde(default = "default_github_oauth_base")]
    pub github_oauth_base: String,
    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_github_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira_client_secret: Option<String>,
    #[serde(default = "default_jira_oauth_base")]
    pub jira_oauth_base: String,
    #[serde(default = "default_jira_api_base")]
    pub jira_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_jira_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_client_secret: Option<String>,
    #[serde(default = "default_slack_api_base")]
    pub slack_api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_slack_signing_secret: Option<String>,
    #[serde(default = "default_webhook_slack_tolerance_seconds")]
    pub webhook_slack_tolerance_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
    /// Activity API base of the generic OAuth provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_api_base: Option<String>,
    /// Full token endpoint URL of the generic OAuth provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_oauth_secret: Option<String>,

    #[serde(default = "default_webhook_rate_limit_per_minute")]
    pub webhook_rate_limit_per_minute: u32,
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicyConfig,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Backoff policy applied when a provider signals a rate limit or a transient failure.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitPolicyConfig {
    /// Starting backoff in seconds; retries use `base_seconds * 2^attempt`.
    ///
    /// Environment variable: `SKILLSYNC_RATE_LIMIT_BASE_SECONDS`
    #[serde(default = "default_rate_limit_base_seconds")]
    #[schema(example = 2)]
    pub base_seconds: u64,

    /// Upper bound for any single backoff, including provider-specified waits.
    ///
    /// Environment variable: `SKILLSYNC_RATE_LIMIT_MAX_SECONDS`
    #[serde(default = "default_rate_limit_max_seconds")]
    #[schema(example = 300)]
    pub max_seconds: u64,

    /// Random jitter added on top of each delay, as a fraction of it.
    ///
    /// Environment variable: `SKILLSYNC_RATE_LIMIT_JITTER_FACTOR`
    #[serde(default = "default_rate_limit_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,

    /// Retries of the same request before the failure is escalated.
    ///
    /// Environment variable: `SKILLSYNC_RATE_LIMIT_MAX_RETRIES`
    #[serde(default = "default_rate_limit_max_retries")]
    #[schema(example = 5)]
    pub max_retries: u32,

    /// Per-provider overrides keyed by provider slug.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_overrides: BTreeMap<String, RateLimitProviderOverride>,
}

/// Provider-specific rate limit policy overrides.
///
/// Environment variables: `SKILLSYNC_RATE_LIMIT_OVERRIDE_{PROVIDER}_{SETTING}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitProviderOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Background credential refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Interval between background refresh ticks (default: 300)
    #[serde(default = "default_token_refresh_tick_seconds")]
    pub tick_seconds: u64,

    /// Background refresh picks up credentials expiring within this window (default: 900)
    #[serde(default = "default_token_refresh_lead_time_seconds")]
    pub lead_time_seconds: u64,

    /// Safety margin used before every sync (default: 120)
    #[serde(default = "default_token_refresh_margin_seconds")]
    pub margin_seconds: u64,

    /// Maximum concurrent refreshes per tick (default: 4)
    #[serde(default = "default_token_refresh_concurrency")]
    pub concurrency: u32,

    /// Connections examined per tick (default: 100)
    #[serde(default = "default_token_refresh_batch_size")]
    pub batch_size: u64,
}

/// Sync pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Lease duration; renewed after every committed page (default: 900)
    #[serde(default = "default_sync_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// Page size requested from providers (default: 50)
    #[serde(default = "default_sync_page_size")]
    pub page_size: u32,
}

/// Webhook dispatch queue and retry sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatchConfig {
    /// Ordered worker lanes; events for one subject always share a lane (default: 4)
    #[serde(default = "default_dispatch_lanes")]
    pub lanes: usize,

    /// Bounded capacity of each lane (default: 256)
    #[serde(default = "default_dispatch_queue_capacity")]
    pub queue_capacity: usize,

    /// How long ingestion waits for lane capacity before giving up (default: 250)
    #[serde(default = "default_dispatch_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    /// How long the webhook response waits for downstream completion (default: 2000)
    #[serde(default = "default_dispatch_wait_ms")]
    pub wait_ms: u64,

    /// Dispatch attempts before an event is left for manual inspection (default: 5)
    #[serde(default = "default_dispatch_max_attempts")]
    pub max_attempts: u32,

    /// Interval of the retry sweep (default: 60)
    #[serde(default = "default_dispatch_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Events re-dispatched per sweep (default: 100)
    #[serde(default = "default_dispatch_sweep_batch_size")]
    pub sweep_batch_size: u64,
}

/// Confidence scoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InferenceConfig {
    #[serde(default = "default_inference_saturation_scale")]
    pub saturation_scale: f64,
    #[serde(default = "default_inference_staleness_threshold_days")]
    pub staleness_threshold_days: i64,
    #[serde(default = "default_inference_decay_window_days")]
    pub decay_window_days: i64,
    #[serde(default = "default_inference_min_recency_factor")]
    pub min_recency_factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            github_client_id: None,
            github_client_secret: None,
            github_oauth_base: default_github_oauth_base(),
            github_api_base: default_github_api_base(),
            webhook_github_secret: None,
            jira_client_id: None,
            jira_client_secret: None,
            jira_oauth_base: default_jira_oauth_base(),
            jira_api_base: default_jira_api_base(),
            webhook_jira_secret: None,
            slack_client_id: None,
            slack_client_secret: None,
            slack_api_base: default_slack_api_base(),
            webhook_slack_signing_secret: None,
            webhook_slack_tolerance_seconds: default_webhook_slack_tolerance_seconds(),
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_api_base: None,
            oauth_token_url: None,
            webhook_oauth_secret: None,
            webhook_rate_limit_per_minute: default_webhook_rate_limit_per_minute(),
            rate_limit_policy: RateLimitPolicyConfig::default(),
            token_refresh: TokenRefreshConfig::default(),
            sync: SyncConfig::default(),
            dispatch: DispatchConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_rate_limit_base_seconds(),
            max_seconds: default_rate_limit_max_seconds(),
            jitter_factor: default_rate_limit_jitter_factor(),
            max_retries: default_rate_limit_max_retries(),
            provider_overrides: BTreeMap::new(),
        }
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_token_refresh_tick_seconds(),
            lead_time_seconds: default_token_refresh_lead_time_seconds(),
            margin_seconds: default_token_refresh_margin_seconds(),
            concurrency: default_token_refresh_concurrency(),
            batch_size: default_token_refresh_batch_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: default_sync_lease_ttl_seconds(),
            page_size: default_sync_page_size(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lanes: default_dispatch_lanes(),
            queue_capacity: default_dispatch_queue_capacity(),
            enqueue_timeout_ms: default_dispatch_enqueue_timeout_ms(),
            wait_ms: default_dispatch_wait_ms(),
            max_attempts: default_dispatch_max_attempts(),
            sweep_interval_seconds: default_dispatch_sweep_interval_seconds(),
            sweep_batch_size: default_dispatch_sweep_batch_size(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            saturation_scale: default_inference_saturation_scale(),
            staleness_threshold_days: default_inference_staleness_threshold_days(),
            decay_window_days: default_inference_decay_window_days(),
            min_recency_factor: default_inference_min_recency_factor(),
        }
    }
}

impl RateLimitPolicyConfig {
    /// Validate rate limit policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRateLimitBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRateLimitJitter {
                value: self.jitter_factor,
            });
        }

        for (provider, override_config) in &self.provider_overrides {
            if provider.parse::<Provider>().is_err() {
                return Err(ConfigError::UnknownRateLimitProvider {
                    provider: provider.clone(),
                });
            }

            let base = override_config.base_seconds.unwrap_or(self.base_seconds);
            let max = override_config.max_seconds.unwrap_or(self.max_seconds);
            let jitter = override_config.jitter_factor.unwrap_or(self.jitter_factor);

            if base > max {
                return Err(ConfigError::InvalidRateLimitProviderBounds {
                    provider: provider.clone(),
                    base,
                    max,
                });
            }

            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::InvalidRateLimitProviderJitter {
                    provider: provider.clone(),
                    value: jitter,
                });
            }
        }

        Ok(())
    }
}

impl TokenRefreshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_seconds < 10 {
            return Err(ConfigError::InvalidTokenRefreshTickInterval {
                value: self.tick_seconds,
            });
        }

        if self.lead_time_seconds < self.margin_seconds || self.lead_time_seconds > 86400 {
            return Err(ConfigError::InvalidTokenRefreshLeadTime {
                value: self.lead_time_seconds,
                margin: self.margin_seconds,
            });
        }

        if self.concurrency == 0 || self.concurrency > 20 {
            return Err(ConfigError::InvalidTokenRefreshConcurrency {
                value: self.concurrency,
            });
        }

        Ok(())
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_seconds < 30 {
            return Err(ConfigError::InvalidLeaseTtl {
                value: self.lease_ttl_seconds,
            });
        }
        if self.page_size == 0 || self.page_size > 100 {
            return Err(ConfigError::InvalidPageSize {
                value: self.page_size,
            });
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lanes == 0 || self.lanes > 64 {
            return Err(ConfigError::InvalidDispatchLanes { value: self.lanes });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidDispatchQueueCapacity);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidDispatchMaxAttempts);
        }
        Ok(())
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.saturation_scale <= 0.0 {
            return Err(ConfigError::InvalidInferencePolicy {
                field: "saturation_scale",
                reason: "must be positive",
            });
        }
        if self.staleness_threshold_days < 0 {
            return Err(ConfigError::InvalidInferencePolicy {
                field: "staleness_threshold_days",
                reason: "must not be negative",
            });
        }
        if self.decay_window_days <= 0 {
            return Err(ConfigError::InvalidInferencePolicy {
                field: "decay_window_days",
                reason: "must be positive",
            });
        }
        if !(0.0..=1.0).contains(&self.min_recency_factor) {
            return Err(ConfigError::InvalidInferencePolicy {
                field: "min_recency_factor",
                reason: "must be between 0.0 and 1.0",
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Shared secret used to verify inbound webhooks for `provider`.
    pub fn webhook_secret(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Github => self.webhook_github_secret.as_deref(),
            Provider::Jira => self.webhook_jira_secret.as_deref(),
            Provider::Slack => self.webhook_slack_signing_secret.as_deref(),
            Provider::GenericOAuth => self.webhook_oauth_secret.as_deref(),
        }
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        for secret in [
            &mut config.github_client_secret,
            &mut config.webhook_github_secret,
            &mut config.jira_client_secret,
            &mut config.webhook_jira_secret,
            &mut config.slack_client_secret,
            &mut config.webhook_slack_signing_secret,
            &mut config.oauth_client_secret,
            &mut config.webhook_oauth_secret,
        ] {
            if secret.is_some() {
                *secret = Some("[REDACTED]".to_string());
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        // A client id without its secret cannot refresh tokens.
        for (provider, id, secret) in [
            ("github", &self.github_client_id, &self.github_client_secret),
            ("jira", &self.jira_client_id, &self.jira_client_secret),
            ("slack", &self.slack_client_id, &self.slack_client_secret),
            ("oauth", &self.oauth_client_id, &self.oauth_client_secret),
        ] {
            if id.is_some() != secret.is_some() {
                return Err(ConfigError::IncompleteClientCredentials {
                    provider: provider.to_string(),
                });
            }
        }

        if self.oauth_client_id.is_some()
            && (self.oauth_api_base.is_none() || self.oauth_token_url.is_none())
        {
            return Err(ConfigError::MissingGenericOAuthEndpoints);
        }

        if self.webhook_slack_tolerance_seconds == 0 {
            return Err(ConfigError::InvalidSlackTolerance {
                value: self.webhook_slack_tolerance_seconds,
            });
        }

        self.rate_limit_policy.validate()?;
        self.token_refresh.validate()?;
        self.sync.validate()?;
        self.dispatch.validate()?;
        self.inference.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/skill_sync".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_github_oauth_base() -> String {
    "https://github.com".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_jira_oauth_base() -> String {
    "https://auth.atlassian.com".to_string()
}

fn default_jira_api_base() -> String {
    "https://api.atlassian.com".to_string()
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_webhook_slack_tolerance_seconds() -> u64 {
    300
}

fn default_webhook_rate_limit_per_minute() -> u32 {
    300
}

fn default_rate_limit_base_seconds() -> u64 {
    2
}

fn default_rate_limit_max_seconds() -> u64 {
    300
}

fn default_rate_limit_jitter_factor() -> f64 {
    0.1
}

fn default_rate_limit_max_retries() -> u32 {
    5
}

fn default_token_refresh_tick_seconds() -> u64 {
    300
}

fn default_token_refresh_lead_time_seconds() -> u64 {
    900
}

fn default_token_refresh_margin_seconds() -> u64 {
    120
}

fn default_token_refresh_concurrency() -> u32 {
    4
}

fn default_token_refresh_batch_size() -> u64 {
    100
}

fn default_sync_lease_ttl_seconds() -> u64 {
    900
}

fn default_sync_page_size() -> u32 {
    50
}

fn default_dispatch_lanes() -> usize {
    4
}

fn default_dispatch_queue_capacity() -> usize {
    256
}

fn default_dispatch_enqueue_timeout_ms() -> u64 {
    250
}

fn default_dispatch_wait_ms() -> u64 {
    2000
}

fn default_dispatch_max_attempts() -> u32 {
    5
}

fn default_dispatch_sweep_interval_seconds() -> u64 {
    60
}

fn default_dispatch_sweep_batch_size() -> u64 {
    100
}

fn default_inference_saturation_scale() -> f64 {
    policy::SATURATION_SCALE
}

fn default_inference_staleness_threshold_days() -> i64 {
    policy::STALENESS_THRESHOLD_DAYS
}

fn default_inference_decay_window_days() -> i64 {
    policy::DECAY_WINDOW_DAYS
}

fn default_inference_min_recency_factor() -> f64 {
    policy::MIN_RECENCY_FACTOR
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set SKILLSYNC_OPERATOR_TOKEN or SKILLSYNC_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set SKILLSYNC_CRYPTO_KEY")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("{provider} client id and client secret must be configured together")]
    IncompleteClientCredentials { provider: String },
    #[error(
        "generic OAuth provider needs SKILLSYNC_OAUTH_API_BASE and SKILLSYNC_OAUTH_TOKEN_URL"
    )]
    MissingGenericOAuthEndpoints,
    #[error("rate limit base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRateLimitBounds { base: u64, max: u64 },
    #[error("rate limit jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRateLimitJitter { value: f64 },
    #[error("rate limit override names unknown provider '{provider}'")]
    UnknownRateLimitProvider { provider: String },
    #[error(
        "provider {provider} rate limit base seconds ({base}) cannot be greater than max seconds ({max})"
    )]
    InvalidRateLimitProviderBounds {
        provider: String,
        base: u64,
        max: u64,
    },
    #[error(
        "provider {provider} rate limit jitter factor must be between 0.0 and 1.0, got {value}"
    )]
    InvalidRateLimitProviderJitter { provider: String, value: f64 },
    #[error("token refresh tick interval must be at least 10 seconds, got {value}")]
    InvalidTokenRefreshTickInterval { value: u64 },
    #[error(
        "token refresh lead time must be between the refresh margin ({margin}) and 86400 seconds, got {value}"
    )]
    InvalidTokenRefreshLeadTime { value: u64, margin: u64 },
    #[error("token refresh concurrency must be between 1 and 20, got {value}")]
    InvalidTokenRefreshConcurrency { value: u32 },
    #[error("sync lease ttl must be at least 30 seconds, got {value}")]
    InvalidLeaseTtl { value: u64 },
    #[error("sync page size must be between 1 and 100, got {value}")]
    InvalidPageSize { value: u32 },
    #[error("dispatch lanes must be between 1 and 64, got {value}")]
    InvalidDispatchLanes { value: usize },
    #[error("dispatch queue capacity must be positive")]
    InvalidDispatchQueueCapacity,
    #[error("dispatch max attempts must be positive")]
    InvalidDispatchMaxAttempts,
    #[error("inference {field} {reason}")]
    InvalidInferencePolicy {
        field: &'static str,
        reason: &'static str,
    },
    #[error("webhook Slack tolerance must be positive, got {value}")]
    InvalidSlackTolerance { value: u64 },
}

/// Loads configuration using layered `.env` files and `SKILLSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`, then the
    /// process environment, each layer overriding the previous one.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);

        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(encoded) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(encoded.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let rate_limit_policy = RateLimitPolicyConfig {
            base_seconds: take_parsed(&mut layered, "RATE_LIMIT_BASE_SECONDS")
                .unwrap_or_else(default_rate_limit_base_seconds),
            max_seconds: take_parsed(&mut layered, "RATE_LIMIT_MAX_SECONDS")
                .unwrap_or_else(default_rate_limit_max_seconds),
            jitter_factor: take_parsed(&mut layered, "RATE_LIMIT_JITTER_FACTOR")
                .unwrap_or_else(default_rate_limit_jitter_factor),
            max_retries: take_parsed(&mut layered, "RATE_LIMIT_MAX_RETRIES")
                .unwrap_or_else(default_rate_limit_max_retries),
            provider_overrides: parse_provider_overrides(&layered),
        };

        let token_refresh = TokenRefreshConfig {
            tick_seconds: take_parsed(&mut layered, "TOKEN_REFRESH_TICK_SECONDS")
                .unwrap_or_else(default_token_refresh_tick_seconds),
            lead_time_seconds: take_parsed(&mut layered, "TOKEN_REFRESH_LEAD_TIME_SECONDS")
                .unwrap_or_else(default_token_refresh_lead_time_seconds),
            margin_seconds: take_parsed(&mut layered, "TOKEN_REFRESH_MARGIN_SECONDS")
                .unwrap_or_else(default_token_refresh_margin_seconds),
            concurrency: take_parsed(&mut layered, "TOKEN_REFRESH_CONCURRENCY")
                .unwrap_or_else(default_token_refresh_concurrency),
            batch_size: take_parsed(&mut layered, "TOKEN_REFRESH_BATCH_SIZE")
                .unwrap_or_else(default_token_refresh_batch_size),
        };

        let sync = SyncConfig {
            lease_ttl_seconds: take_parsed(&mut layered, "SYNC_LEASE_TTL_SECONDS")
                .unwrap_or_else(default_sync_lease_ttl_seconds),
            page_size: take_parsed(&mut layered, "SYNC_PAGE_SIZE")
                .unwrap_or_else(default_sync_page_size),
        };

        let dispatch = DispatchConfig {
            lanes: take_parsed(&mut layered, "DISPATCH_LANES")
                .unwrap_or_else(default_dispatch_lanes),
            queue_capacity: take_parsed(&mut layered, "DISPATCH_QUEUE_CAPACITY")
                .unwrap_or_else(default_dispatch_queue_capacity),
            enqueue_timeout_ms: take_parsed(&mut layered, "DISPATCH_ENQUEUE_TIMEOUT_MS")
                .unwrap_or_else(default_dispatch_enqueue_timeout_ms),
            wait_ms: take_parsed(&mut layered, "DISPATCH_WAIT_MS")
                .unwrap_or_else(default_dispatch_wait_ms),
            max_attempts: take_parsed(&mut layered, "DISPATCH_MAX_ATTEMPTS")
                .unwrap_or_else(default_dispatch_max_attempts),
            sweep_interval_seconds: take_parsed(&mut layered, "DISPATCH_SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(default_dispatch_sweep_interval_seconds),
            sweep_batch_size: take_parsed(&mut layered, "DISPATCH_SWEEP_BATCH_SIZE")
                .unwrap_or_else(default_dispatch_sweep_batch_size),
        };

        let inference = InferenceConfig {
            saturation_scale: take_parsed(&mut layered, "INFERENCE_SATURATION_SCALE")
                .unwrap_or_else(default_inference_saturation_scale),
            staleness_threshold_days: take_parsed(
                &mut layered,
                "INFERENCE_STALENESS_THRESHOLD_DAYS",
            )
            .unwrap_or_else(default_inference_staleness_threshold_days),
            decay_window_days: take_parsed(&mut layered, "INFERENCE_DECAY_WINDOW_DAYS")
                .unwrap_or_else(default_inference_decay_window_days),
            min_recency_factor: take_parsed(&mut layered, "INFERENCE_MIN_RECENCY_FACTOR")
                .unwrap_or_else(default_inference_min_recency_factor),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
                .unwrap_or_else(default_db_acquire_timeout_ms),
            operator_tokens,
            crypto_key,
            github_client_id: take_string(&mut layered, "GITHUB_CLIENT_ID"),
            github_client_secret: take_string(&mut layered, "GITHUB_CLIENT_SECRET"),
            github_oauth_base: take_string(&mut layered, "GITHUB_OAUTH_BASE")
                .unwrap_or_else(default_github_oauth_base),
            github_api_base: take_string(&mut layered, "GITHUB_API_BASE")
                .unwrap_or_else(default_github_api_base),
            webhook_github_secret: take_string(&mut layered, "WEBHOOK_GITHUB_SECRET"),
            jira_client_id: take_string(&mut layered, "JIRA_CLIENT_ID"),
            jira_client_secret: take_string(&mut layered, "JIRA_CLIENT_SECRET"),
            jira_oauth_base: take_string(&mut layered, "JIRA_OAUTH_BASE")
                .unwrap_or_else(default_jira_oauth_base),
            jira_api_base: take_string(&mut layered, "JIRA_API_BASE")
                .unwrap_or_else(default_jira_api_base),
            webhook_jira_secret: take_string(&mut layered, "WEBHOOK_JIRA_SECRET"),
            slack_client_id: take_string(&mut layered, "SLACK_CLIENT_ID"),
            slack_client_secret: take_string(&mut layered, "SLACK_CLIENT_SECRET"),
            slack_api_base: take_string(&mut layered, "SLACK_API_BASE")
                .unwrap_or_else(default_slack_api_base),
            webhook_slack_signing_secret: take_string(&mut layered, "WEBHOOK_SLACK_SIGNING_SECRET"),
            webhook_slack_tolerance_seconds: take_parsed(
                &mut layered,
                "WEBHOOK_SLACK_TOLERANCE_SECONDS",
            )
            .unwrap_or_else(default_webhook_slack_tolerance_seconds),
            oauth_client_id: take_string(&mut layered, "OAUTH_CLIENT_ID"),
            oauth_client_secret: take_string(&mut layered, "OAUTH_CLIENT_SECRET"),
            oauth_api_base: take_string(&mut layered, "OAUTH_API_BASE"),
            oauth_token_url: take_string(&mut layered, "OAUTH_TOKEN_URL"),
            webhook_oauth_secret: take_string(&mut layered, "WEBHOOK_OAUTH_SECRET"),
            webhook_rate_limit_per_minute: take_parsed(
                &mut layered,
                "WEBHOOK_RATE_LIMIT_PER_MINUTE",
            )
            .unwrap_or_else(default_webhook_rate_limit_per_minute),
            rate_limit_policy,
            token_refresh,
            sync,
            dispatch,
            inference,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(self.base_dir.join(format!(".env.{profile}")), &mut values)?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{profile}.local")),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    take_string(layered, key).and_then(|v| v.parse().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Collects `RATE_LIMIT_OVERRIDE_<PROVIDER>_<SETTING>` keys.
fn parse_provider_overrides(
    layered: &BTreeMap<String, String>,
) -> BTreeMap<String, RateLimitProviderOverride> {
    let mut overrides: BTreeMap<String, RateLimitProviderOverride> = BTreeMap::new();

    for (key, value) in layered {
        let Some(suffix) = key.strip_prefix("RATE_LIMIT_OVERRIDE_") else {
            continue;
        };
        let Some((provider, setting)) = suffix.split_once('_') else {
            continue;
        };
        let entry = overrides.entry(provider.to_lowercase()).or_default();
        let value = value.trim();

        match setting.to_lowercase().as_str() {
            "base_seconds" => entry.base_seconds = value.parse().ok(),
            "max_seconds" => entry.max_seconds = value.parse().ok(),
            "jitter_factor" => entry.jitter_factor = value.parse().ok(),
            "max_retries" => entry.max_retries = value.parse().ok(),
            other => tracing::warn!(setting = other, "ignoring unknown rate limit override"),
        }
    }

    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            operator_tokens: vec!["token".into()],
            crypto_key: Some(vec![7u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_with_key_and_token_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_crypto_key_is_rejected() {
        let config = AppConfig {
            crypto_key: None,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCryptoKey)
        ));
    }

    #[test]
    fn half_configured_client_credentials_are_rejected() {
        let config = AppConfig {
            jira_client_id: Some("id".into()),
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompleteClientCredentials { provider }) if provider == "jira"
        ));
    }

    #[test]
    fn rate_limit_policy_validation() {
        let mut policy = RateLimitPolicyConfig::default();
        assert!(policy.validate().is_ok());

        policy.base_seconds = 1000;
        policy.max_seconds = 10;
        assert!(policy.validate().is_err());

        let mut policy = RateLimitPolicyConfig::default();
        policy.jitter_factor = 1.5;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn provider_override_bounds_are_checked() {
        let mut policy = RateLimitPolicyConfig::default();
        policy.provider_overrides.insert(
            "github".to_string(),
            RateLimitProviderOverride {
                base_seconds: Some(100),
                max_seconds: Some(50),
                ..Default::default()
            },
        );
        assert!(policy.validate().is_err());

        let mut policy = RateLimitPolicyConfig::default();
        policy
            .provider_overrides
            .insert("gitlab".to_string(), RateLimitProviderOverride::default());
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::UnknownRateLimitProvider { .. })
        ));
    }

    #[test]
    fn override_keys_are_parsed_case_insensitively() {
        let mut layered = BTreeMap::new();
        layered.insert(
            "RATE_LIMIT_OVERRIDE_GITHUB_BASE_SECONDS".to_string(),
            "7".to_string(),
        );
        layered.insert(
            "RATE_LIMIT_OVERRIDE_GITHUB_MAX_RETRIES".to_string(),
            "2".to_string(),
        );
        layered.insert(
            "RATE_LIMIT_OVERRIDE_SLACK_JITTER_FACTOR".to_string(),
            "0.5".to_string(),
        );

        let overrides = parse_provider_overrides(&layered);
        assert_eq!(overrides["github"].base_seconds, Some(7));
        assert_eq!(overrides["github"].max_retries, Some(2));
        assert_eq!(overrides["slack"].jitter_factor, Some(0.5));
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let config = AppConfig {
            webhook_github_secret: Some("hook-secret".into()),
            github_client_id: Some("client".into()),
            github_client_secret: Some("client-secret".into()),
            ..valid_config()
        };
        let json = config.redacted_json().unwrap();
        assert!(!json.contains("hook-secret"));
        assert!(!json.contains("client-secret"));
        assert!(!json.contains("\"token\""));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn inference_policy_bounds() {
        let mut config = valid_config();
        config.inference.min_recency_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.inference.saturation_scale = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn webhook_secret_lookup_by_provider() {
        let config = AppConfig {
            webhook_slack_signing_secret: Some("slack".into()),
            ..valid_config()
        };
        assert_eq!(config.webhook_secret(Provider::Slack), Some("slack"));
        assert_eq!(config.webhook_secret(Provider::Github), None);
    }
}
