//! # Server Configuration
//!
//! Wires the stores, provider adapters and pipeline services together, builds
//! the router and runs the HTTP server alongside the background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    extract::FromRef,
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::connection_registry::ConnectionRegistry;
use crate::crypto::CryptoKey;
use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::inference::{ConfidencePolicy, SkillInferenceEngine};
use crate::providers::ProviderRegistry;
use crate::repositories::{
    ConnectionRepository, LeaseRepository, SkillRepository, WebhookEventRepository,
};
use crate::store::{ConnectionStore, LeaseStore, SkillStore, WebhookLog};
use crate::sync_orchestrator::{ActivitySink, SyncOrchestrator};
use crate::telemetry::trace_context_middleware;
use crate::token_refresh::TokenRefreshService;
use crate::webhook_gateway::WebhookGateway;
use crate::webhook_verification::WebhookRateLimiter;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub connections: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub gateway: Arc<WebhookGateway>,
    pub skills: Arc<dyn SkillStore>,
    pub token_refresh: Arc<TokenRefreshService>,
    pub webhook_limiter: Arc<WebhookRateLimiter>,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

impl AppState {
    /// Builds the SeaORM-backed pipeline and starts the dispatcher lanes.
    /// The returned handles finish once `shutdown` fires.
    pub fn build(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        providers: ProviderRegistry,
        shutdown: CancellationToken,
    ) -> anyhow::Result<(Self, Vec<JoinHandle<()>>)> {
        let key_bytes = config
            .crypto_key
            .clone()
            .context("SKILLSYNC_CRYPTO_KEY is required")?;
        let crypto_key = CryptoKey::new(key_bytes).context("invalid crypto key")?;

        let shared_db = Arc::new(db.clone());
        let connection_store: Arc<dyn ConnectionStore> =
            Arc::new(ConnectionRepository::new(shared_db.clone(), crypto_key));
        let skills: Arc<dyn SkillStore> = Arc::new(SkillRepository::new(shared_db.clone()));
        let webhook_log: Arc<dyn WebhookLog> =
            Arc::new(WebhookEventRepository::new(shared_db.clone()));
        let leases: Arc<dyn LeaseStore> = Arc::new(LeaseRepository::new(shared_db));

        let connections = Arc::new(ConnectionRegistry::new(
            connection_store.clone(),
            providers.clone(),
            Duration::from_secs(config.token_refresh.margin_seconds),
        ));
        let engine = Arc::new(SkillInferenceEngine::new(
            skills.clone(),
            ConfidencePolicy::from(&config.inference),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            connections.clone(),
            leases,
            engine,
            config.sync.lease_ttl(),
            shutdown.clone(),
        ));

        let sink: Arc<dyn ActivitySink> = orchestrator.clone();
        let (dispatcher, workers) =
            Dispatcher::start(&config.dispatch, sink, webhook_log.clone(), shutdown);
        let gateway = Arc::new(WebhookGateway::new(
            &config,
            providers,
            connection_store,
            webhook_log,
            Arc::new(dispatcher),
        ));

        let token_refresh = Arc::new(TokenRefreshService::new(
            config.token_refresh.clone(),
            connections.clone(),
        ));
        let webhook_limiter = Arc::new(WebhookRateLimiter::new(
            config.webhook_rate_limit_per_minute,
        ));

        Ok((
            Self {
                config,
                db,
                connections,
                orchestrator,
                gateway,
                skills,
                token_refresh,
                webhook_limiter,
            },
            workers,
        ))
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route(
            "/owners/{owner_id}/connections",
            post(handlers::connections::connect),
        )
        .route(
            "/connections/{connection_id}/disconnect",
            post(handlers::connections::disconnect),
        )
        .route(
            "/owners/{owner_id}/providers/{provider}/sync",
            post(handlers::sync::trigger_sync),
        )
        .route(
            "/owners/{owner_id}/skills",
            get(handlers::skills::list_skills),
        )
        .route_layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/providers", get(handlers::providers::list_providers))
        .route(
            "/webhooks/{provider}",
            post(handlers::webhooks::ingest_webhook),
        )
        .merge(operator_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_context_middleware))
}

/// Starts the server and the background tasks; returns after a graceful
/// shutdown on Ctrl-C or SIGTERM.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();
    let providers =
        ProviderRegistry::from_config(&config).context("failed to build provider clients")?;
    let (state, mut tasks) = AppState::build(config.clone(), db, providers, shutdown.clone())?;

    let refresh = state.token_refresh.clone();
    let refresh_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        refresh.run(refresh_shutdown).await;
    }));

    let gateway = state.gateway.clone();
    let sweep_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        gateway.run_retry_sweeper(sweep_shutdown).await;
    }));

    let app = create_app(state);
    let addr = config.bind_addr().context("invalid SKILLSYNC_API_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, profile = %config.profile, "Server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    for task in tasks {
        if let Err(error) = task.await {
            warn!(error = %error, "Background task ended abnormally");
        }
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::providers::list_providers,
        crate::handlers::webhooks::ingest_webhook,
        crate::handlers::connections::connect,
        crate::handlers::connections::disconnect,
        crate::handlers::sync::trigger_sync,
        crate::handlers::skills::list_skills,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::types::HealthResponse,
            crate::handlers::types::ProvidersResponse,
            crate::handlers::types::ConnectRequest,
            crate::handlers::types::ConnectionInfo,
            crate::handlers::types::SkillsResponse,
            crate::handlers::types::WebhookAck,
            crate::handlers::types::SlackChallenge,
            crate::providers::ProviderMetadata,
            crate::providers::SignatureScheme,
            crate::sync_orchestrator::SyncSummary,
            crate::sync_orchestrator::SyncMode,
            crate::domain::SkillRecord,
            crate::domain::SkillCategory,
            crate::domain::SkillLevel,
            crate::domain::SkillSource,
            crate::domain::ConnectionStatus,
            crate::domain::Cursor,
            crate::domain::OwnerId,
        )
    ),
    modifiers(&BearerSecurity),
    tags(
        (name = "root", description = "Service metadata and health"),
        (name = "providers", description = "Provider catalog"),
        (name = "webhooks", description = "Public provider webhooks"),
        (name = "operators", description = "Operator-authenticated management endpoints"),
    ),
    info(
        title = "skill-sync API",
        description = "Provider integration sync and skill inference",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
