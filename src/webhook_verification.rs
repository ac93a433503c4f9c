//! # Webhook Signature Verification
//!
//! HMAC-SHA256 and shared-secret checks used by the provider adapters, plus the
//! fixed-window limiter guarding the public webhook route. Every comparison is
//! constant-time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur during webhook signature verification
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: String },

    #[error("Invalid timestamp format: {header}")]
    InvalidTimestamp { header: String },

    #[error("Timestamp outside tolerance: {seconds}s skew, max allowed: {max_seconds}s")]
    TimestampOutOfTolerance { seconds: u64, max_seconds: u64 },
}

impl VerificationError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

pub type VerificationResult<T> = Result<T, VerificationError>;

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn hmac_sha256(secret: &str, message: &[u8]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn compare_hex(expected: &[u8], provided_hex: &str, header: &str) -> VerificationResult<()> {
    let provided = hex::decode(provided_hex).map_err(|_| VerificationError::InvalidSignatureFormat {
        header: format!("{header} contains invalid hex"),
    })?;
    if expected.ct_eq(&provided[..]).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies a `sha256=<hex>` HMAC signature carried in `header`.
///
/// GitHub uses `X-Hub-Signature-256`; the generic OAuth provider uses
/// `X-Webhook-Signature` with the same scheme.
pub fn verify_sha256_signature(
    body: &[u8],
    headers: &HeaderMap,
    header: &str,
    secret: &str,
) -> VerificationResult<()> {
    let value = header_str(headers, header).unwrap_or_default();
    if value.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: header.to_string(),
        });
    }

    let provided_hex =
        value
            .strip_prefix("sha256=")
            .ok_or_else(|| VerificationError::InvalidSignatureFormat {
                header: format!("{header} must start with 'sha256='"),
            })?;

    debug!(body_size = body.len(), header, "Verifying sha256 webhook signature");
    let expected = hmac_sha256(secret, body)?;
    compare_hex(&expected, provided_hex, header)
}

/// Verifies a Slack v0 signature: `HMAC(secret, "v0:{ts}:{body}")`, with the
/// request timestamp within `tolerance_seconds` of `now_secs`.
pub fn verify_slack_signature(
    body: &[u8],
    headers: &HeaderMap,
    secret: &str,
    tolerance_seconds: u64,
    now_secs: u64,
) -> VerificationResult<()> {
    let signature = header_str(headers, "x-slack-signature").unwrap_or_default();
    if signature.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Slack-Signature".to_string(),
        });
    }

    let timestamp_header = header_str(headers, "x-slack-request-timestamp").unwrap_or_default();
    if timestamp_header.is_empty() {
        return Err(VerificationError::MissingTimestamp {
            header: "X-Slack-Request-Timestamp".to_string(),
        });
    }

    let timestamp =
        timestamp_header
            .parse::<u64>()
            .map_err(|_| VerificationError::InvalidTimestamp {
                header: "X-Slack-Request-Timestamp must be a valid Unix timestamp".to_string(),
            })?;

    let skew = now_secs.abs_diff(timestamp);
    if skew > tolerance_seconds {
        return Err(VerificationError::TimestampOutOfTolerance {
            seconds: skew,
            max_seconds: tolerance_seconds,
        });
    }

    let provided_hex =
        signature
            .strip_prefix("v0=")
            .ok_or_else(|| VerificationError::InvalidSignatureFormat {
                header: "X-Slack-Signature must start with 'v0='".to_string(),
            })?;

    let mut base = format!("v0:{timestamp}:").into_bytes();
    base.extend_from_slice(body);
    let expected = hmac_sha256(secret, &base)?;
    compare_hex(&expected, provided_hex, "X-Slack-Signature")
}

/// Verifies `Authorization: Bearer <secret>`, the scheme Jira webhooks are
/// registered with.
pub fn verify_bearer_secret(headers: &HeaderMap, secret: &str) -> VerificationResult<()> {
    let value = header_str(headers, "authorization").unwrap_or_default();
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| VerificationError::MissingSignature {
            header: "Authorization (Bearer)".to_string(),
        })?;

    if token.as_bytes().ct_eq(secret.as_bytes()).into() {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fixed one-minute window limiter keyed by provider slug.
#[derive(Debug)]
pub struct WebhookRateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<String, (u64, u32)>>,
}

impl WebhookRateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request and reports whether it exceeds the window's budget.
    pub fn is_limited(&self, key: &str) -> bool {
        self.is_limited_at(key, unix_now())
    }

    pub fn is_limited_at(&self, key: &str, now_secs: u64) -> bool {
        let window = now_secs / 60;
        let mut guard = self
            .windows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let entry = guard.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        if entry.1 >= self.per_minute {
            true
        } else {
            entry.1 += 1;
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn sha256_signature(secret: &str, body: &[u8]) -> String {
        format!("sha256={}", hex::encode(hmac_sha256(secret, body).unwrap()))
    }

    pub fn slack_signature(secret: &str, timestamp: u64, body: &[u8]) -> String {
        let mut base = format!("v0:{timestamp}:").into_bytes();
        base.extend_from_slice(body);
        format!("v0={}", hex::encode(hmac_sha256(secret, &base).unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn github_signature_accepts_valid_and_rejects_tampered_body() {
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let sig = sha256_signature("s3cret", body);
        let h = headers(&[("x-hub-signature-256", &sig)]);

        assert!(verify_sha256_signature(body, &h, "x-hub-signature-256", "s3cret").is_ok());
        assert!(matches!(
            verify_sha256_signature(b"{}", &h, "x-hub-signature-256", "s3cret"),
            Err(VerificationError::VerificationFailed)
        ));
        assert!(matches!(
            verify_sha256_signature(body, &h, "x-hub-signature-256", "other"),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[test]
    fn sha256_signature_requires_prefix_and_header() {
        let body = b"{}";
        assert!(matches!(
            verify_sha256_signature(body, &HeaderMap::new(), "x-webhook-signature", "k"),
            Err(VerificationError::MissingSignature { .. })
        ));
        let h = headers(&[("x-webhook-signature", "deadbeef")]);
        assert!(matches!(
            verify_sha256_signature(body, &h, "x-webhook-signature", "k"),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
    }

    #[test]
    fn slack_signature_checks_timestamp_tolerance() {
        let body = br#"{"type":"event_callback"}"#;
        let ts = 1_700_000_000;
        let sig = slack_signature("signing", ts, body);
        let ts_str = ts.to_string();
        let h = headers(&[
            ("x-slack-signature", &sig),
            ("x-slack-request-timestamp", &ts_str),
        ]);

        assert!(verify_slack_signature(body, &h, "signing", 300, ts + 10).is_ok());
        assert!(matches!(
            verify_slack_signature(body, &h, "signing", 300, ts + 301),
            Err(VerificationError::TimestampOutOfTolerance { .. })
        ));
        assert!(matches!(
            verify_slack_signature(b"{}", &h, "signing", 300, ts),
            Err(VerificationError::VerificationFailed)
        ));
    }

    #[test]
    fn bearer_secret_comparison() {
        let h = headers(&[("authorization", "Bearer jira-secret")]);
        assert!(verify_bearer_secret(&h, "jira-secret").is_ok());
        assert!(verify_bearer_secret(&h, "jira-secret-2").is_err());
        assert!(matches!(
            verify_bearer_secret(&HeaderMap::new(), "jira-secret"),
            Err(VerificationError::MissingSignature { .. })
        ));
    }

    #[test]
    fn rate_limiter_resets_each_window() {
        let limiter = WebhookRateLimiter::new(2);
        let t = 6_000;
        assert!(!limiter.is_limited_at("github", t));
        assert!(!limiter.is_limited_at("github", t + 1));
        assert!(limiter.is_limited_at("github", t + 2));
        assert!(!limiter.is_limited_at("slack", t + 2));
        assert!(!limiter.is_limited_at("github", t + 60));
    }
}
