//! Provider adapters
//!
//! - [`ProviderAdapter`]: the interface every activity source implements
//! - [`ProviderRegistry`]: lookup from [`Provider`] to its adapter
//! - One adapter per provider: GitHub, Jira, Slack and a generic OAuth feed

pub mod generic;
pub mod github;
pub mod http;
pub mod jira;
pub mod metadata;
pub mod oauth;
pub mod registry;
pub mod slack;
pub mod trait_;

pub use generic::GenericOAuthAdapter;
pub use github::GithubAdapter;
pub use http::BackoffPolicy;
pub use jira::JiraAdapter;
pub use metadata::{ProviderMetadata, SignatureScheme};
pub use oauth::OAuthClientConfig;
pub use registry::{ProviderRegistry, RegistryError};
pub use slack::SlackAdapter;
pub use trait_::{ActivityPage, AuthenticatedClient, ProviderAdapter, ProviderError};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use url::Url;

use crate::domain::Provider;

/// String at a JSON pointer.
pub(crate) fn str_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(Value::as_str)
}

/// Identifier at a JSON pointer; providers send ids as numbers or strings.
pub(crate) fn id_at(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn require<T>(value: Option<T>, what: &str) -> Result<T, ProviderError> {
    value.ok_or_else(|| ProviderError::validation(format!("missing {what}")))
}

/// Accepts RFC 3339, Jira's `+0000` offsets, epoch seconds or milliseconds,
/// and Slack's `"1700000000.000100"` timestamps.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
                return Some(dt.with_timezone(&Utc));
            }
            s.parse::<f64>().ok().and_then(epoch_seconds)
        }
        Value::Number(n) => {
            let raw = n.as_f64()?;
            // Values this large are milliseconds.
            if raw > 1e11 {
                epoch_seconds(raw / 1000.0)
            } else {
                epoch_seconds(raw)
            }
        }
        _ => None,
    }
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs.fract()) * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
}

/// Joins a configured base with an API path.
pub(crate) fn endpoint(provider: Provider, base: &str, path: &str) -> Result<Url, ProviderError> {
    Url::parse(&format!("{}{}", base.trim_end_matches('/'), path)).map_err(|e| {
        ProviderError::Configuration(format!("invalid {provider} API base '{base}': {e}"))
    })
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("name").and_then(Value::as_str).map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_in_provider_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-03-01T12:00:00Z")), Some(expected));
        assert_eq!(
            parse_timestamp(&json!("2024-03-01T12:00:00.000+0000")),
            Some(expected)
        );
        assert_eq!(parse_timestamp(&json!(expected.timestamp())), Some(expected));
        assert_eq!(
            parse_timestamp(&json!(expected.timestamp_millis())),
            Some(expected)
        );
        let slack = parse_timestamp(&json!(format!("{}.000100", expected.timestamp()))).unwrap();
        assert_eq!(slack.timestamp(), expected.timestamp());
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn ids_and_lists() {
        let payload = json!({"sender": {"id": 42}, "labels": [{"name": "rust"}, "backend"]});
        assert_eq!(id_at(&payload, "/sender/id").as_deref(), Some("42"));
        assert_eq!(
            string_list(payload.get("labels")),
            vec!["rust".to_string(), "backend".to_string()]
        );
    }
}
