//! Jira adapter
//!
//! Backfill pages through issues the user is assigned to or reported, oldest
//! update first, using `startAt` offsets. Webhooks contribute issue create and
//! update events.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::http::{BackoffPolicy, send_with_retry};
use super::oauth::{OAuthClientConfig, refresh_grant};
use super::{
    ActivityPage, AuthenticatedClient, ProviderAdapter, ProviderError, ProviderMetadata,
    SignatureScheme, endpoint, id_at, parse_timestamp, require, str_at, string_list,
};
use crate::domain::{
    Activity, ActivityDraft, ActivityKind, Connection, Credential, Cursor, Provider,
    WebhookEnvelope,
};
use crate::webhook_verification::{header_str, verify_bearer_secret};

const BACKFILL_JQL: &str =
    "assignee = currentUser() OR reporter = currentUser() ORDER BY updated ASC";

#[derive(Debug, Clone)]
pub struct JiraAdapter {
    http: reqwest::Client,
    /// Site REST base, e.g. `https://api.atlassian.com/ex/jira/<cloud-id>`
    api_base: String,
    oauth: Option<OAuthClientConfig>,
    policy: BackoffPolicy,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    start_at: u64,
    total: u64,
    #[serde(default)]
    issues: Vec<Value>,
}

/// Fields shared by search results and webhook `issue` objects.
struct IssueFields {
    id: String,
    project: String,
    occurred_at: Option<chrono::DateTime<Utc>>,
    attributes: Value,
}

fn issue_fields(issue: &Value) -> Result<IssueFields, ProviderError> {
    let id = require(id_at(issue, "/id"), "issue id")?;
    let project = require(str_at(issue, "/fields/project/key"), "issue project")?;
    Ok(IssueFields {
        id,
        project: project.to_string(),
        occurred_at: issue.pointer("/fields/updated").and_then(parse_timestamp),
        attributes: json!({
            "key": issue.get("key"),
            "summary": issue.pointer("/fields/summary"),
            "labels": string_list(issue.pointer("/fields/labels")),
            "components": string_list(issue.pointer("/fields/components")),
        }),
    })
}

impl JiraAdapter {
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
}

#[async_trait]
impl ProviderAdapter for JiraAdapter {
    fn provider(&self) -> Provider {
        Provider::Jira
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(
            Provider::Jira,
            "Jira",
            &["read:jira-work", "read:jira-user", "offline_access"],
            SignatureScheme::BearerSecret,
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
            Provider::Jira,
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
        let start_at = cursor.and_then(|c| c.u64_field("start_at")).unwrap_or(0);

        let mut url = endpoint(Provider::Jira, &self.api_base, "/rest/api/3/search")?;
        url.query_pairs_mut()
            .append_pair("jql", BACKFILL_JQL)
            .append_pair("startAt", &start_at.to_string())
            .append_pair("maxResults", &self.page_size.to_string())
            .append_pair("fields", "summary,labels,components,updated,project");

        let response = send_with_retry(&self.policy, Provider::Jira, || client.get(url.clone()))
            .await?;
        let body: SearchResponse = response.json().await?;

        let mut activities = Vec::with_capacity(body.issues.len());
        for issue in &body.issues {
            let fields = match issue_fields(issue) {
                Ok(fields) => fields,
                Err(error) => {
                    warn!(error = %error, key = ?issue.get("key"), "Skipping malformed Jira issue");
                    continue;
                }
            };
            activities.push(Activity {
                owner_id: client.owner_id,
                provider: Provider::Jira,
                kind: ActivityKind::Issue,
                external_id: fields.id,
                occurred_at: fields.occurred_at.unwrap_or_else(Utc::now),
                subject: fields.project,
                attributes: fields.attributes,
            });
        }

        let fetched = body.issues.len() as u64;
        let has_more = fetched > 0 && body.start_at + fetched < body.total;
        let next_start = if has_more {
            body.start_at + fetched
        } else {
            body.start_at
        };

        Ok(ActivityPage {
            activities,
            next_cursor: Some(Cursor::from_json(json!({ "start_at": next_start }))),
            has_more,
        })
    }

    fn webhook_envelope(
        &self,
        headers: &HeaderMap,
        payload: &Value,
    ) -> Result<WebhookEnvelope, ProviderError> {
        let delivery_id = require(
            header_str(headers, "x-atlassian-webhook-identifier"),
            "X-Atlassian-Webhook-Identifier",
        )?;
        let event_type = require(str_at(payload, "/webhookEvent"), "webhookEvent")?;
        Ok(WebhookEnvelope {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            action: str_at(payload, "/issue_event_type_name").map(str::to_string),
        })
    }

    fn verify_webhook_signature(&self, _raw_body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        verify_bearer_secret(headers, secret)
            .inspect_err(|error| debug!(error = %error, "Jira webhook secret rejected"))
            .is_ok()
    }

    fn normalize_webhook_payload(
        &self,
        envelope: &WebhookEnvelope,
        payload: &Value,
    ) -> Result<Option<ActivityDraft>, ProviderError> {
        if !matches!(
            envelope.event_type.as_str(),
            "jira:issue_created" | "jira:issue_updated"
        ) {
            return Ok(None);
        }

        let issue = require(payload.get("issue").filter(|i| i.is_object()), "issue")?;
        let fields = issue_fields(issue)?;
        let actor = require(str_at(payload, "/user/accountId"), "user accountId")?;
        let occurred_at = payload
            .get("timestamp")
            .and_then(parse_timestamp)
            .or(fields.occurred_at)
            .unwrap_or_else(Utc::now);

        Ok(Some(ActivityDraft {
            provider: Provider::Jira,
            kind: ActivityKind::Issue,
            external_id: fields.id,
            occurred_at,
            subject: fields.project,
            actor_account_id: actor.to_string(),
            attributes: fields.attributes,
        }))
    }
}
