use reqwest::StatusCode;
use serde_json::{Value, json};
use skill_sync::config::AppConfig;
use skill_sync::server::create_app;
use skill_sync::webhook_verification::unix_now;
use uuid::Uuid;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

mod test_utils;
use test_utils::{
    GITHUB_SECRET, OPERATOR_TOKEN, SLACK_SECRET, TestPipeline, sha256_signature, slack_signature,
    test_config,
};

struct TestServer {
    base: String,
    client: reqwest::Client,
    pipeline: TestPipeline,
}

impl TestServer {
    async fn spawn(config: AppConfig) -> Self {
        let pipeline = TestPipeline::start(config).await.unwrap();
        let app = create_app(pipeline.state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            pipeline,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn operator_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(OPERATOR_TOKEN)
    }

    async fn connect(&self, owner: Uuid, provider: &str, account: &str) -> reqwest::Response {
        self.operator_post(&format!("/owners/{owner}/connections"))
            .json(&json!({
                "provider": provider,
                "external_account_id": account,
                "access_token": "api-access",
                "refresh_token": "api-refresh",
                "scopes": ["repo"]
            }))
            .send()
            .await
            .unwrap()
    }

    async fn skills(&self, owner: Uuid) -> Value {
        self.client
            .get(self.url(&format!("/owners/{owner}/skills")))
            .bearer_auth(OPERATOR_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

fn problem_content_type(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/problem+json"))
}

#[tokio::test]
async fn public_metadata_endpoints() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;

    let root: Value = server
        .client
        .get(server.url("/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(root["service"], "skill-sync");

    let health = server.client.get(server.url("/healthz")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health, json!({"status": "ok", "database": "ok"}));

    let providers: Value = server
        .client
        .get(server.url("/providers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let slugs: Vec<&str> = providers["providers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["provider"].as_str().unwrap())
        .collect();
    assert_eq!(slugs, vec!["github", "jira", "oauth", "slack"]);

    let openapi: Value = server
        .client
        .get(server.url("/openapi.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(openapi["paths"]["/webhooks/{provider}"].is_object());
    assert!(openapi["components"]["securitySchemes"]["bearer_auth"].is_object());

    server.pipeline.stop().await;
}

#[tokio::test]
async fn operator_routes_require_a_bearer_token() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let owner = Uuid::new_v4();

    let anonymous = server
        .client
        .get(server.url(&format!("/owners/{owner}/skills")))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert!(problem_content_type(&anonymous));
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");

    let wrong = server
        .client
        .post(server.url(&format!("/owners/{owner}/providers/github/sync")))
        .bearer_auth("not-an-operator")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let allowed = server
        .client
        .get(server.url(&format!("/owners/{owner}/skills")))
        .bearer_auth(OPERATOR_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["owner_id"], owner.to_string());
    assert_eq!(body["skills"], json!([]));

    server.pipeline.stop().await;
}

#[tokio::test]
async fn connection_lifecycle_over_http() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let owner = Uuid::new_v4();

    let created = server.connect(owner, "github", "1001").await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let info: Value = created.json().await.unwrap();
    assert_eq!(info["provider"], "github");
    assert_eq!(info["status"], "active");
    assert_eq!(info["has_refresh_token"], true);
    assert!(info.get("access_token").is_none());
    let connection_id = info["id"].as_str().unwrap().to_string();

    let duplicate = server.connect(owner, "github", "2002").await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body: Value = duplicate.json().await.unwrap();
    assert_eq!(body["code"], "CONNECTION_EXISTS");

    let empty = server
        .operator_post(&format!("/owners/{owner}/connections"))
        .json(&json!({
            "provider": "slack",
            "external_account_id": "U1",
            "access_token": ""
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = empty.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert_eq!(body["details"]["access_token"], "must not be empty");

    let unknown = server
        .operator_post(&format!("/owners/{owner}/connections"))
        .json(&json!({
            "provider": "gitlab",
            "external_account_id": "x",
            "access_token": "t"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    let revoked = server
        .operator_post(&format!("/connections/{connection_id}/disconnect"))
        .send()
        .await
        .unwrap();
    assert_eq!(revoked.status(), StatusCode::NO_CONTENT);

    let missing = server
        .operator_post(&format!("/connections/{}/disconnect", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    // The slot is free again.
    let replacement = server.connect(owner, "github", "2002").await;
    assert_eq!(replacement.status(), StatusCode::CREATED);

    server.pipeline.stop().await;
}

#[tokio::test]
async fn manual_sync_populates_skills() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "full_name": "acme/api", "language": "Rust", "pushed_at": "2024-05-01T12:00:00Z"},
            {"id": 2, "full_name": "acme/cli", "language": "Go", "pushed_at": "2024-05-02T12:00:00Z"}
        ])))
        .mount(&mock)
        .await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let owner = Uuid::new_v4();
    assert_eq!(
        server.connect(owner, "github", "1001").await.status(),
        StatusCode::CREATED
    );

    let response = server
        .operator_post(&format!("/owners/{owner}/providers/github/sync?full=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary: Value = response.json().await.unwrap();
    assert_eq!(summary["activities_processed"], 2);
    assert_eq!(summary["pages_committed"], 1);
    assert_eq!(summary["skills_touched"], json!(["Go", "Rust"]));

    let skills = server.skills(owner).await;
    let listed: Vec<(String, String)> = skills["skills"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| {
            (
                s["skill_name"].as_str().unwrap().to_string(),
                s["source"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        listed,
        vec![
            ("Go".to_string(), "aggregate".to_string()),
            ("Go".to_string(), "github".to_string()),
            ("Rust".to_string(), "aggregate".to_string()),
            ("Rust".to_string(), "github".to_string()),
        ]
    );

    server.pipeline.stop().await;
}

#[tokio::test]
async fn sync_errors_map_to_problem_responses() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let owner = Uuid::new_v4();

    let unknown = server
        .operator_post(&format!("/owners/{owner}/providers/gitlab/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    let body: Value = unknown.json().await.unwrap();
    assert_eq!(body["code"], "UNKNOWN_PROVIDER");

    let unconnected = server
        .operator_post(&format!("/owners/{owner}/providers/github/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(unconnected.status(), StatusCode::NOT_FOUND);
    let body: Value = unconnected.json().await.unwrap();
    assert_eq!(body["code"], "NO_ACTIVE_CONNECTION");

    // Nothing is mounted for Jira, so the provider answers 404.
    assert_eq!(
        server.connect(owner, "jira", "acct-1").await.status(),
        StatusCode::CREATED
    );
    let failed = server
        .operator_post(&format!("/owners/{owner}/providers/jira/sync"))
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
    assert!(problem_content_type(&failed));
    let body: Value = failed.json().await.unwrap();
    assert_eq!(body["code"], "PROVIDER_ERROR");
    assert_eq!(body["details"]["summary"]["pages_committed"], 0);

    server.pipeline.stop().await;
}

fn push_body(sender: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": "refs/heads/main",
        "after": "c0ffee",
        "repository": {"full_name": "acme/api"},
        "sender": {"id": sender},
        "head_commit": {"id": "c0ffee", "timestamp": "2024-05-01T12:00:00Z"},
        "commits": [{"id": "c0ffee", "added": ["src/main.rs"], "modified": [], "removed": []}]
    }))
    .unwrap()
}

#[tokio::test]
async fn github_webhook_is_accepted_once() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let owner = Uuid::new_v4();
    assert_eq!(
        server.connect(owner, "github", "1001").await.status(),
        StatusCode::CREATED
    );

    let body = push_body(1001);
    let send = |delivery: &'static str, signature: String| {
        server
            .client
            .post(server.url("/webhooks/github"))
            .header("content-type", "application/json")
            .header("x-github-delivery", delivery)
            .header("x-github-event", "push")
            .header("x-hub-signature-256", signature)
            .body(body.clone())
            .send()
    };

    let accepted = send("gh-1", sha256_signature(GITHUB_SECRET, &body)).await.unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let ack: Value = accepted.json().await.unwrap();
    assert_eq!(ack["status"], "accepted");
    assert!(ack["event_id"].is_string());

    let duplicate = send("gh-1", sha256_signature(GITHUB_SECRET, &body)).await.unwrap();
    assert_eq!(duplicate.status(), StatusCode::OK);
    let ack: Value = duplicate.json().await.unwrap();
    assert_eq!(ack, json!({"status": "duplicate"}));

    let forged = send("gh-2", sha256_signature("guess", &body)).await.unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    assert!(problem_content_type(&forged));

    let skills = server.skills(owner).await;
    assert!(
        skills["skills"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["skill_name"] == "Rust")
    );

    let unknown = server
        .client
        .post(server.url("/webhooks/bitbucket"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let headerless = server
        .client
        .post(server.url("/webhooks/github"))
        .header("x-hub-signature-256", sha256_signature(GITHUB_SECRET, &body))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(headerless.status(), StatusCode::BAD_REQUEST);

    server.pipeline.stop().await;
}

#[tokio::test]
async fn slack_url_verification_requires_a_valid_signature() {
    let mock = MockServer::start().await;
    let server = TestServer::spawn(test_config(&mock.uri())).await;
    let body = serde_json::to_vec(&json!({
        "type": "url_verification",
        "challenge": "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P",
        "token": "legacy"
    }))
    .unwrap();

    let unsigned = server
        .client
        .post(server.url("/webhooks/slack"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let timestamp = unix_now();
    let signed = server
        .client
        .post(server.url("/webhooks/slack"))
        .header("x-slack-request-timestamp", timestamp.to_string())
        .header(
            "x-slack-signature",
            slack_signature(SLACK_SECRET, timestamp, &body),
        )
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::OK);
    let echoed: Value = signed.json().await.unwrap();
    assert_eq!(
        echoed,
        json!({"challenge": "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"})
    );

    server.pipeline.stop().await;
}

#[tokio::test]
async fn webhook_flood_is_rate_limited_per_provider() {
    let mock = MockServer::start().await;
    let config = AppConfig {
        webhook_rate_limit_per_minute: 2,
        ..test_config(&mock.uri())
    };
    let server = TestServer::spawn(config).await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = server
            .client
            .post(server.url("/webhooks/jira"))
            .body("{}")
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after: u64 = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .expect("retry-after header");
            assert!((1..=60).contains(&retry_after));
            let body: Value = response.json().await.unwrap();
            assert_eq!(body["code"], "RATE_LIMITED");
        }
    }
    assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);

    // Other providers have their own budget.
    let slack = server
        .client
        .post(server.url("/webhooks/slack"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_ne!(slack.status(), StatusCode::TOO_MANY_REQUESTS);

    server.pipeline.stop().await;
}
