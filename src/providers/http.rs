//! Shared HTTP plumbing for adapters: status mapping, rate-limit detection and
//! retry with exponential backoff.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::RateLimitPolicyConfig;
use crate::domain::Provider;
use crate::providers::ProviderError;

/// Delay schedule applied to rate-limited, transient and network failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_factor: f64, max_retries: u32) -> Self {
        Self {
            base,
            max,
            jitter_factor,
            max_retries,
        }
    }

    /// Resolves the global policy with any override configured for `provider`.
    pub fn from_config(config: &RateLimitPolicyConfig, provider: Provider) -> Self {
        let overrides = config.provider_overrides.get(provider.slug());
        let pick_secs = |global: u64, over: Option<u64>| Duration::from_secs(over.unwrap_or(global));

        Self {
            base: pick_secs(config.base_seconds, overrides.and_then(|o| o.base_seconds)),
            max: pick_secs(config.max_seconds, overrides.and_then(|o| o.max_seconds)),
            jitter_factor: overrides
                .and_then(|o| o.jitter_factor)
                .unwrap_or(config.jitter_factor),
            max_retries: overrides
                .and_then(|o| o.max_retries)
                .unwrap_or(config.max_retries),
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    ///
    /// A server hint wins over the exponential schedule; both are capped at `max`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            let factor = 2u32.saturating_pow(attempt.min(31));
            self.base.saturating_mul(factor)
        });
        delay.min(self.max)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..spread);
        delay + Duration::from_secs_f64(jitter)
    }
}

/// Server-provided wait from `Retry-After` or `X-RateLimit-Reset`.
fn rate_limit_hint(response: &Response) -> Option<Duration> {
    let headers = response.headers();
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    if let Some(secs) = header_u64("retry-after") {
        return Some(Duration::from_secs(secs));
    }

    header_u64("x-ratelimit-reset").map(|reset| {
        let now = Utc::now().timestamp().max(0) as u64;
        Duration::from_secs(reset.saturating_sub(now))
    })
}

fn is_rate_limited(response: &Response) -> bool {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == StatusCode::FORBIDDEN
        && response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() == "0")
}

enum Failure {
    Retry {
        error: ProviderError,
        hint: Option<Duration>,
    },
    Fatal(ProviderError),
}

async fn classify(response: Response) -> Result<Response, Failure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if is_rate_limited(&response) {
        let hint = rate_limit_hint(&response);
        return Err(Failure::Retry {
            error: ProviderError::RateLimited {
                retry_after_secs: hint.map(|d| d.as_secs()),
            },
            hint,
        });
    }

    let body = response.text().await.unwrap_or_default();
    let code = status.as_u16();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Failure::Fatal(ProviderError::Auth(format!(
            "provider returned 401: {body}"
        ))));
    }
    if status.is_server_error() {
        return Err(Failure::Retry {
            error: ProviderError::upstream(Some(code), body, true),
            hint: None,
        });
    }
    Err(Failure::Fatal(ProviderError::upstream(Some(code), body, false)))
}

/// Sends the request built by `build`, retrying the identical request on rate
/// limits, 5xx and network errors until `policy.max_retries` is exhausted.
pub async fn send_with_retry<F>(
    policy: &BackoffPolicy,
    provider: Provider,
    build: F,
) -> Result<Response, ProviderError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let failure = match build().send().await {
            Ok(response) => match classify(response).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            },
            Err(error) => {
                let error = ProviderError::from(error);
                if error.is_retryable() {
                    Failure::Retry { error, hint: None }
                } else {
                    Failure::Fatal(error)
                }
            }
        };

        let (error, hint) = match failure {
            Failure::Fatal(error) => return Err(error),
            Failure::Retry { error, hint } => (error, hint),
        };

        if matches!(error, ProviderError::RateLimited { .. }) {
            metrics::counter!("provider_rate_limited_total", "provider" => provider.slug())
                .increment(1);
        }

        if attempt >= policy.max_retries {
            warn!(
                provider = %provider,
                attempts = attempt + 1,
                error = %error,
                "Giving up after exhausting retries"
            );
            return Err(error);
        }

        let delay = policy.with_jitter(policy.delay_for(attempt, hint));
        debug!(
            provider = %provider,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying provider request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Extracts the `rel="next"` target from an RFC 8288 `Link` header.
pub fn parse_link_next(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|p| p.trim() == r#"rel="next""#);
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitProviderOverride;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 0.0, max_retries)
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10), 0.0, 5);
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(10));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.5, 1);
        for _ in 0..50 {
            let d = policy.with_jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(10) && d < Duration::from_secs(15));
        }
    }

    #[test]
    fn provider_override_replaces_global_values() {
        let mut config = RateLimitPolicyConfig::default();
        config.provider_overrides.insert(
            "github".to_string(),
            RateLimitProviderOverride {
                base_seconds: Some(7),
                max_seconds: None,
                jitter_factor: None,
                max_retries: Some(1),
            },
        );

        let github = BackoffPolicy::from_config(&config, Provider::Github);
        assert_eq!(github.base, Duration::from_secs(7));
        assert_eq!(github.max, Duration::from_secs(config.max_seconds));
        assert_eq!(github.max_retries, 1);

        let slack = BackoffPolicy::from_config(&config, Provider::Slack);
        assert_eq!(slack.base, Duration::from_secs(config.base_seconds));
    }

    #[test]
    fn parses_next_link() {
        let header = r#"<https://api.github.com/user/repos?page=2>; rel="next", <https://api.github.com/user/repos?page=5>; rel="last""#;
        assert_eq!(
            parse_link_next(header).as_deref(),
            Some("https://api.github.com/user/repos?page=2")
        );
        assert_eq!(
            parse_link_next(r#"<https://x/?page=1>; rel="prev""#),
            None
        );
    }

    #[tokio::test]
    async fn retries_rate_limited_request_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/thing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/thing", server.uri());
        let response = send_with_retry(&fast_policy(3), Provider::Github, || client.get(&url))
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn escalates_rate_limit_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("Retry-After", "0"),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let err = send_with_retry(&fast_policy(2), Provider::Github, || client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(0)
            }
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn maps_unauthorized_and_client_errors_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let auth_url = format!("{}/auth", server.uri());
        let err = send_with_retry(&fast_policy(3), Provider::Jira, || client.get(&auth_url))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));

        let missing_url = format!("{}/missing", server.uri());
        let err = send_with_retry(&fast_policy(3), Provider::Jira, || client.get(&missing_url))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Upstream {
                status: Some(404),
                retryable: false,
                ..
            }
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn server_errors_escalate_as_retryable_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let err = send_with_retry(&fast_policy(1), Provider::Slack, || client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Upstream {
                status: Some(503),
                retryable: true,
                ..
            }
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
