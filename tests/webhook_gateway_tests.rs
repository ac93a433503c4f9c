use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use skill_sync::config::AppConfig;
use skill_sync::connection_registry::ConnectionRegistry;
use skill_sync::dispatcher::{DispatchOutcome, Dispatcher};
use skill_sync::domain::{
    Activity, Credential, OwnerId, Provider, SkillSource,
};
use skill_sync::inference::{ConfidencePolicy, InferenceItemError, SkillInferenceEngine};
use skill_sync::providers::ProviderRegistry;
use skill_sync::store::{SkillStore, WebhookLog};
use skill_sync::store::memory::{
    MemoryConnectionStore, MemoryLeaseStore, MemorySkillStore, MemoryWebhookLog,
};
use skill_sync::sync_orchestrator::{ActivitySink, SyncError, SyncOrchestrator, SyncSummary};
use skill_sync::webhook_gateway::{AcceptReason, GatewayError, IngestOutcome, WebhookGateway};
use skill_sync::webhook_verification::unix_now;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod test_utils;
use test_utils::{
    GENERIC_SECRET, GITHUB_SECRET, JIRA_SECRET, SLACK_SECRET, sha256_signature, slack_signature,
    test_config,
};

/// Fails the first `failures` deliveries, then hands activities to the orchestrator.
struct FlakySink {
    inner: Arc<SyncOrchestrator>,
    failures: AtomicUsize,
}

#[async_trait]
impl ActivitySink for FlakySink {
    async fn deliver(
        &self,
        owner_id: OwnerId,
        activity: Activity,
    ) -> Result<SyncSummary, SyncError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Inference(InferenceItemError::Storage {
                skill_name: "Rust".to_string(),
                message: "database is locked".to_string(),
            }));
        }
        self.inner.deliver(owner_id, activity).await
    }
}

struct Harness {
    gateway: WebhookGateway,
    log: Arc<MemoryWebhookLog>,
    skills: Arc<MemorySkillStore>,
    connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    fn new(config: AppConfig, failures: usize) -> Self {
        let providers = ProviderRegistry::from_config(&config).unwrap();
        let connection_store = Arc::new(MemoryConnectionStore::new());
        let skills = Arc::new(MemorySkillStore::new());
        let log = Arc::new(MemoryWebhookLog::new());
        let shutdown = CancellationToken::new();

        let connections = Arc::new(ConnectionRegistry::new(
            connection_store.clone(),
            providers.clone(),
            Duration::from_secs(120),
        ));
        let engine = Arc::new(SkillInferenceEngine::new(
            skills.clone(),
            ConfidencePolicy::default(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            connections.clone(),
            Arc::new(MemoryLeaseStore::new()),
            engine,
            Duration::from_secs(60),
            shutdown.clone(),
        ));
        let sink = Arc::new(FlakySink {
            inner: orchestrator,
            failures: AtomicUsize::new(failures),
        });
        let (dispatcher, workers) =
            Dispatcher::start(&config.dispatch, sink, log.clone(), shutdown.clone());
        let gateway = WebhookGateway::new(
            &config,
            providers,
            connection_store,
            log.clone(),
            Arc::new(dispatcher),
        );

        Self {
            gateway,
            log,
            skills,
            connections,
            shutdown,
            workers,
        }
    }

    async fn connect(&self, provider: Provider, account: &str) -> OwnerId {
        let owner = OwnerId::new();
        self.connections
            .connect(owner, provider, account, Credential::new("access"))
            .await
            .unwrap();
        owner
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

fn config() -> AppConfig {
    test_config("http://127.0.0.1:9")
}

fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    headers
}

fn push_payload(sender_id: u64) -> Value {
    json!({
        "ref": "refs/heads/main",
        "after": "9f1c2d3e",
        "repository": { "full_name": "acme/api" },
        "sender": { "id": sender_id, "login": "octodev" },
        "head_commit": { "id": "9f1c2d3e", "timestamp": "2024-05-01T12:00:00Z" },
        "commits": [{
            "id": "9f1c2d3e",
            "added": ["src/lib.rs"],
            "modified": ["web/app.ts"],
            "removed": []
        }]
    })
}

fn github_headers(delivery: &str, event: &str, body: &[u8], secret: &str) -> HeaderMap {
    headers(&[
        ("x-github-delivery", delivery.to_string()),
        ("x-github-event", event.to_string()),
        ("x-hub-signature-256", sha256_signature(secret, body)),
    ])
}

async fn expect_processed(outcome: IngestOutcome) -> SyncSummary {
    match outcome {
        IngestOutcome::Dispatched { receipt, .. } => match receipt.await {
            Ok(DispatchOutcome::Processed(summary)) => summary,
            other => panic!("dispatch did not succeed: {other:?}"),
        },
        other => panic!("expected a dispatched event, got {other:?}"),
    }
}

#[tokio::test]
async fn signed_push_is_applied_to_the_connected_owner() {
    let harness = Harness::new(config(), 0);
    let owner = harness.connect(Provider::Github, "1001").await;

    let body = serde_json::to_vec(&push_payload(1001)).unwrap();
    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-1", "push", &body, GITHUB_SECRET),
            &body,
        )
        .await
        .unwrap();
    let summary = expect_processed(outcome).await;
    assert_eq!(summary.activities_processed, 1);
    assert_eq!(summary.skills_touched, vec!["Rust", "TypeScript"]);

    let events = harness.log.all().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].verified);
    assert!(events[0].processed);
    assert_eq!(events[0].event_type, "push");
    assert_eq!(events[0].subject.as_deref(), Some("acme/api"));

    let records = harness.skills.find_by_owner(owner).await.unwrap();
    assert!(records.iter().any(|r| {
        r.skill_name == "Rust" && r.source == SkillSource::Provider(Provider::Github)
    }));

    harness.stop().await;
}

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_without_reprocessing() {
    let harness = Harness::new(config(), 0);
    harness.connect(Provider::Github, "1001").await;

    let body = serde_json::to_vec(&push_payload(1001)).unwrap();
    let signed = github_headers("d-dup", "push", &body, GITHUB_SECRET);

    let first = harness.gateway.ingest("github", &signed, &body).await.unwrap();
    expect_processed(first).await;
    let evidence = harness.skills.evidence_count().await;

    let second = harness.gateway.ingest("github", &signed, &body).await.unwrap();
    assert!(matches!(second, IngestOutcome::Duplicate));
    assert_eq!(harness.log.all().await.len(), 1);
    assert_eq!(harness.skills.evidence_count().await, evidence);

    harness.stop().await;
}

#[tokio::test]
async fn bad_signature_is_logged_unverified_and_does_not_block_redelivery() {
    let harness = Harness::new(config(), 0);
    harness.connect(Provider::Github, "1001").await;
    let body = serde_json::to_vec(&push_payload(1001)).unwrap();

    let forged = github_headers("d-2", "push", &body, "not-the-secret");
    let error = harness
        .gateway
        .ingest("github", &forged, &body)
        .await
        .expect_err("forged signature");
    assert!(matches!(
        error,
        GatewayError::SignatureRejected {
            provider: Provider::Github
        }
    ));

    let events = harness.log.all().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].verified);
    assert!(!events[0].retryable);
    assert_eq!(
        events[0].error_message.as_deref(),
        Some("signature verification failed")
    );

    let genuine = github_headers("d-2", "push", &body, GITHUB_SECRET);
    let outcome = harness.gateway.ingest("github", &genuine, &body).await.unwrap();
    expect_processed(outcome).await;
    assert_eq!(harness.log.all().await.len(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn provider_without_secret_rejects_every_delivery() {
    let config = AppConfig {
        webhook_github_secret: None,
        ..config()
    };
    let harness = Harness::new(config, 0);
    let body = serde_json::to_vec(&push_payload(1001)).unwrap();

    let error = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-3", "push", &body, GITHUB_SECRET),
            &body,
        )
        .await
        .expect_err("no secret configured");
    assert!(matches!(error, GatewayError::SignatureRejected { .. }));
    assert_eq!(
        harness.log.all().await[0].error_message.as_deref(),
        Some("no webhook secret configured")
    );

    harness.stop().await;
}

#[tokio::test]
async fn unattributed_and_untracked_events_are_logged_without_dispatch() {
    let harness = Harness::new(config(), 0);

    let body = serde_json::to_vec(&push_payload(4242)).unwrap();
    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-4", "push", &body, GITHUB_SECRET),
            &body,
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Accepted {
            reason: AcceptReason::Unattributed,
            ..
        }
    ));

    let star = serde_json::to_vec(&json!({"action": "created", "sender": {"id": 1}})).unwrap();
    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-5", "star", &star, GITHUB_SECRET),
            &star,
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Accepted {
            reason: AcceptReason::Ignored,
            ..
        }
    ));

    let events = harness.log.all().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.processed));
    assert_eq!(harness.skills.evidence_count().await, 0);

    harness.stop().await;
}

#[tokio::test]
async fn malformed_requests_are_rejected_before_logging() {
    let harness = Harness::new(config(), 0);
    let body = serde_json::to_vec(&push_payload(1001)).unwrap();

    let unknown = harness
        .gateway
        .ingest("gitlab", &HeaderMap::new(), &body)
        .await;
    assert!(matches!(unknown, Err(GatewayError::UnknownProvider(p)) if p == "gitlab"));

    let not_json = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-6", "push", b"{oops", GITHUB_SECRET),
            b"{oops",
        )
        .await;
    assert!(matches!(not_json, Err(GatewayError::Validation(_))));

    let no_delivery = headers(&[
        ("x-github-event", "push".to_string()),
        ("x-hub-signature-256", sha256_signature(GITHUB_SECRET, &body)),
    ]);
    let missing = harness.gateway.ingest("github", &no_delivery, &body).await;
    assert!(matches!(missing, Err(GatewayError::Validation(_))));

    assert!(harness.log.all().await.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn payload_that_fails_normalization_is_rejected_permanently() {
    let harness = Harness::new(config(), 0);
    let body = serde_json::to_vec(&json!({
        "commits": [{"id": "1", "added": ["a.rs"]}],
        "sender": {"id": 1001}
    }))
    .unwrap();

    let error = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-7", "push", &body, GITHUB_SECRET),
            &body,
        )
        .await
        .expect_err("push without a repository");
    assert!(matches!(error, GatewayError::Validation(_)));

    let events = harness.log.all().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].verified);
    assert!(!events[0].processed);
    assert!(!events[0].retryable);

    harness.stop().await;
}

#[tokio::test]
async fn failed_dispatch_is_completed_by_the_retry_sweep() {
    let harness = Harness::new(config(), 1);
    let owner = harness.connect(Provider::Github, "1001").await;
    let body = serde_json::to_vec(&push_payload(1001)).unwrap();

    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-8", "push", &body, GITHUB_SECRET),
            &body,
        )
        .await
        .unwrap();
    let IngestOutcome::Dispatched { event_id, receipt } = outcome else {
        panic!("expected dispatch");
    };
    assert!(matches!(receipt.await, Ok(DispatchOutcome::Failed(_))));

    let pending = harness.log.all().await;
    assert!(!pending[0].processed);
    assert!(pending[0].retryable);
    assert_eq!(pending[0].attempts, 1);
    assert!(harness.skills.find_by_owner(owner).await.unwrap().is_empty());

    let stats = harness.gateway.retry_pending(10).await.unwrap();
    assert_eq!(stats.attempted, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);

    let events = harness.log.all().await;
    assert_eq!(events[0].id, event_id);
    assert!(events[0].processed);
    assert!(!harness.skills.find_by_owner(owner).await.unwrap().is_empty());

    // Nothing is left for the next sweep.
    let idle = harness.gateway.retry_pending(10).await.unwrap();
    assert_eq!(idle.attempted, 0);

    harness.stop().await;
}

#[tokio::test]
async fn later_push_waits_behind_a_failed_one_on_the_same_repository() {
    let harness = Harness::new(config(), 1);
    let owner = harness.connect(Provider::Github, "1001").await;

    let first = serde_json::to_vec(&push_payload(1001)).unwrap();
    let mut second_payload = push_payload(1001);
    second_payload["after"] = json!("a7b8c9d0");
    let second = serde_json::to_vec(&second_payload).unwrap();

    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-20", "push", &first, GITHUB_SECRET),
            &first,
        )
        .await
        .unwrap();
    let IngestOutcome::Dispatched { event_id: first_id, receipt } = outcome else {
        panic!("expected dispatch");
    };
    assert!(matches!(receipt.await, Ok(DispatchOutcome::Failed(_))));

    // The sink would accept this one, but the earlier push has not landed yet.
    let outcome = harness
        .gateway
        .ingest(
            "github",
            &github_headers("d-21", "push", &second, GITHUB_SECRET),
            &second,
        )
        .await
        .unwrap();
    let IngestOutcome::Dispatched { event_id: second_id, receipt } = outcome else {
        panic!("expected dispatch");
    };
    match receipt.await {
        Ok(DispatchOutcome::Failed(message)) => assert!(message.contains("earlier event")),
        other => panic!("expected the push to wait, got {other:?}"),
    }
    assert!(harness.skills.find_by_owner(owner).await.unwrap().is_empty());
    let waiting = harness.log.get(second_id).await.unwrap().unwrap();
    assert!(!waiting.processed);
    assert_eq!(waiting.attempts, 1);

    let stats = harness.gateway.retry_pending(10).await.unwrap();
    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 0);

    let first_event = harness.log.get(first_id).await.unwrap().unwrap();
    let second_event = harness.log.get(second_id).await.unwrap().unwrap();
    assert!(first_event.processed && second_event.processed);
    assert!(first_event.processed_at <= second_event.processed_at);
    assert_eq!(
        harness.skills.evidence_for(owner, "Rust").await.unwrap().len(),
        2
    );

    harness.stop().await;
}

#[tokio::test]
async fn slack_message_feeds_collaboration() {
    let harness = Harness::new(config(), 0);
    let owner = harness.connect(Provider::Slack, "U024BE7LH").await;

    let body = serde_json::to_vec(&json!({
        "type": "event_callback",
        "event_id": "Ev08MFMKH6",
        "event": {
            "type": "message",
            "user": "U024BE7LH",
            "channel": "C2147483705",
            "channel_type": "channel",
            "text": "shipping the release",
            "ts": "1714564800.000100"
        }
    }))
    .unwrap();
    let timestamp = unix_now();
    let signed = headers(&[
        ("x-slack-request-timestamp", timestamp.to_string()),
        ("x-slack-signature", slack_signature(SLACK_SECRET, timestamp, &body)),
    ]);

    let outcome = harness.gateway.ingest("slack", &signed, &body).await.unwrap();
    let summary = expect_processed(outcome).await;
    assert_eq!(summary.skills_touched, vec!["Collaboration"]);

    let stale = headers(&[
        ("x-slack-request-timestamp", (timestamp - 3_600).to_string()),
        (
            "x-slack-signature",
            slack_signature(SLACK_SECRET, timestamp - 3_600, &body),
        ),
    ]);
    assert!(harness.gateway.verify("slack", &stale, &body).is_err());

    let records = harness.skills.find_by_owner(owner).await.unwrap();
    assert!(records.iter().any(|r| r.skill_name == "Collaboration"));

    harness.stop().await;
}

#[tokio::test]
async fn jira_issue_uses_shared_secret_and_generic_feed_uses_hmac() {
    let harness = Harness::new(config(), 0);
    let jira_owner = harness.connect(Provider::Jira, "5b10ac8d82e05b22cc7d4ef5").await;
    let feed_owner = harness.connect(Provider::GenericOAuth, "acct-9").await;

    let jira_body = serde_json::to_vec(&json!({
        "webhookEvent": "jira:issue_created",
        "timestamp": 1714564800000u64,
        "user": { "accountId": "5b10ac8d82e05b22cc7d4ef5" },
        "issue": {
            "id": "10042",
            "key": "PLAT-42",
            "fields": {
                "project": { "key": "PLAT" },
                "labels": ["kubernetes"],
                "components": [{ "name": "Go" }],
                "updated": "2024-05-01T12:00:00.000+0000"
            }
        }
    }))
    .unwrap();
    let jira_headers = headers(&[
        ("x-atlassian-webhook-identifier", "jira-1".to_string()),
        ("authorization", format!("Bearer {JIRA_SECRET}")),
    ]);
    let summary = expect_processed(
        harness
            .gateway
            .ingest("jira", &jira_headers, &jira_body)
            .await
            .unwrap(),
    )
    .await;
    assert!(summary.skills_touched.contains(&"Issue Tracking".to_string()));
    assert!(summary.skills_touched.contains(&"Kubernetes".to_string()));

    let feed_body = serde_json::to_vec(&json!({
        "type": "activity.created",
        "activity": {
            "id": "act-1",
            "kind": "code-change",
            "occurred_at": "2024-05-01T00:00:00Z",
            "subject": "design-system",
            "actor_id": "acct-9",
            "attributes": { "languages": ["TypeScript"] }
        }
    }))
    .unwrap();
    let feed_headers = headers(&[
        ("x-webhook-id", "wh-1".to_string()),
        ("x-webhook-signature", sha256_signature(GENERIC_SECRET, &feed_body)),
    ]);
    let summary = expect_processed(
        harness
            .gateway
            .ingest("oauth", &feed_headers, &feed_body)
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(summary.skills_touched, vec!["TypeScript"]);

    assert!(!harness.skills.find_by_owner(jira_owner).await.unwrap().is_empty());
    assert!(!harness.skills.find_by_owner(feed_owner).await.unwrap().is_empty());

    harness.stop().await;
}
