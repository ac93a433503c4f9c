//! GitHub adapter
//!
//! Backfill walks the user's repositories (oldest push first) and reports each
//! repository's primary language. Webhooks contribute pushes and issue events.

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{BackoffPolicy, parse_link_next, send_with_retry};
use super::oauth::{OAuthClientConfig, refresh_grant};
use super::{
    ActivityPage, AuthenticatedClient, ProviderAdapter, ProviderError, ProviderMetadata,
    SignatureScheme, endpoint, id_at, parse_timestamp, require, str_at, string_list,
};
use crate::domain::{
    Activity, ActivityDraft, ActivityKind, Connection, Credential, Cursor, Provider,
    WebhookEnvelope,
};
use crate::webhook_verification::{header_str, verify_sha256_signature};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone)]
pub struct GithubAdapter {
    http: reqwest::Client,
    api_base: String,
    oauth: Option<OAuthClientConfig>,
    policy: BackoffPolicy,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct GithubRepo {
    id: u64,
    full_name: String,
    language: Option<String>,
    pushed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl GithubAdapter {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        oauth: Option<OAuthClientConfig>,
        policy: BackoffPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
            oauth,
            policy,
            page_size,
        }
    }

    fn normalize_push(&self, payload: &Value) -> Result<Option<ActivityDraft>, ProviderError> {
        let commits = require(
            payload.get("commits").and_then(Value::as_array),
            "push commits",
        )?;
        if commits.is_empty() {
            return Ok(None);
        }

        let repository = require(str_at(payload, "/repository/full_name"), "repository")?;
        let actor = require(id_at(payload, "/sender/id"), "sender id")?;
        let head = require(
            str_at(payload, "/after").or_else(|| str_at(payload, "/head_commit/id")),
            "head commit",
        )?;

        let files: BTreeSet<String> = commits
            .iter()
            .flat_map(|commit| {
                ["added", "modified", "removed"]
                    .into_iter()
                    .flat_map(|key| string_list(commit.get(key)))
            })
            .collect();

        let occurred_at = payload
            .pointer("/head_commit/timestamp")
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(Some(ActivityDraft {
            provider: Provider::Github,
            kind: ActivityKind::CodeChange,
            external_id: head.to_string(),
            occurred_at,
            subject: repository.to_string(),
            actor_account_id: actor,
            attributes: json!({
                "files": files,
                "commit_count": commits.len(),
                "repository": repository,
                "ref": str_at(payload, "/ref"),
            }),
        }))
    }

    fn normalize_issue(&self, payload: &Value) -> Result<Option<ActivityDraft>, ProviderError> {
        let issue = require(payload.get("issue").filter(|i| i.is_object()), "issue")?;
        let issue_id = require(id_at(issue, "/id"), "issue id")?;
        let repository = require(str_at(payload, "/repository/full_name"), "repository")?;
        let actor = require(id_at(payload, "/sender/id"), "sender id")?;

        let occurred_at = issue
            .get("updated_at")
            .or_else(|| issue.get("created_at"))
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(Some(ActivityDraft {
            provider: Provider::Github,
            kind: ActivityKind::Issue,
            external_id: issue_id,
            occurred_at,
            subject: repository.to_string(),
            actor_account_id: actor,
            attributes: json!({
                "number": issue.get("number"),
                "title": issue.get("title"),
                "labels": string_list(issue.get("labels")),
                "action": payload.get("action"),
            }),
        }))
    }
}

#[async_trait]
impl ProviderAdapter for GithubAdapter {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(
            Provider::Github,
            "GitHub",
            &["repo", "read:user"],
            SignatureScheme::HmacSha256,
        )
    }

    async fn authenticate(
        &self,
        connection: &Connection,
    ) -> Result<AuthenticatedClient, ProviderError> {
        AuthenticatedClient::for_connection(connection, self.http.clone())
    }

    async fn refresh_credential(
        &self,
        credential: &Credential,
    ) -> Result<Credential, ProviderError> {
        refresh_grant(
            &self.http,
            Provider::Github,
            self.oauth.as_ref(),
            &self.policy,
            credential,
        )
        .await
    }

    async fn list_activity_since(
        &self,
        client: &AuthenticatedClient,
        cursor: Option<&Cursor>,
    ) -> Result<ActivityPage, ProviderError> {
        let page = cursor.and_then(|c| c.u64_field("page")).unwrap_or(1).max(1);

        let mut url = endpoint(Provider::Github, &self.api_base, "/user/repos")?;
        url.query_pairs_mut()
            .append_pair("sort", "pushed")
            .append_pair("direction", "asc")
            .append_pair("per_page", &self.page_size.to_string())
            .append_pair("page", &page.to_string());

        let response = send_with_retry(&self.policy, Provider::Github, || {
            client
                .get(url.clone())
                .header("Accept", "application/vnd.github+json")
        })
        .await?;

        let has_more = response
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_link_next)
            .is_some();
        let repos: Vec<GithubRepo> = response.json().await?;

        let activities: Vec<Activity> = repos
            .into_iter()
            .filter_map(|repo| {
                let Some(language) = repo.language else {
                    debug!(repository = %repo.full_name, "Skipping repository without a language");
                    return None;
                };
                Some(Activity {
                    owner_id: client.owner_id,
                    provider: Provider::Github,
                    kind: ActivityKind::LanguageUsage,
                    external_id: format!("{}:{}", repo.id, language),
                    occurred_at: repo.pushed_at.or(repo.updated_at).unwrap_or_else(Utc::now),
                    subject: repo.full_name.clone(),
                    attributes: json!({
                        "language": language,
                        "repository": repo.full_name,
                    }),
                })
            })
            .collect();

        let next_page = if has_more { page + 1 } else { page };
        Ok(ActivityPage {
            activities,
            next_cursor: Some(Cursor::from_json(json!({ "page": next_page }))),
            has_more,
        })
    }

    fn webhook_envelope(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<WebhookEnvelope, ProviderError> {
        let delivery_id = require(header_str(headers, "x-github-delivery"), "X-GitHub-Delivery")?;
        let event_type = require(header_str(headers, "x-github-event"), "X-GitHub-Event")?;
        Ok(WebhookEnvelope {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            action: str_at(payload, "/action").map(str::to_string),
        })
    }

    fn verify_webhook_signature(&self, raw_body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        verify_sha256_signature(raw_body, headers, SIGNATURE_HEADER, secret)
            .inspect_err(|error| debug!(error = %error, "GitHub signature rejected"))
            .is_ok()
    }

    fn normalize_webhook_payload(
        &self,
        envelope: &WebhookEnvelope,
        payload: &Value,
    ) -> Result<Option<ActivityDraft>, ProviderError> {
        match envelope.event_type.as_str() {
            "push" => self.normalize_push(payload),
            "issues" => self.normalize_issue(payload),
            _ => Ok(None),
        }
    }
}
