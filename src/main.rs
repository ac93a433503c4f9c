//! # skill-sync
//!
//! Service entry point: the HTTP server by default, plus one-shot commands for
//! migrations, manual syncs and the webhook retry sweep.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use skill_sync::{
    config::{AppConfig, ConfigLoader},
    db,
    domain::{OwnerId, Provider},
    providers::ProviderRegistry,
    server::{AppState, run_server},
    sync_orchestrator::SyncMode,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "skill-sync", version, about = "Provider activity sync and skill inference")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server and background workers (default)
    Serve {
        /// Apply pending migrations before serving
        #[arg(long, env = "SKILLSYNC_MIGRATE_ON_START")]
        migrate: bool,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one sync pass for an owner's provider connection
    Sync {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        provider: Provider,
        /// Ignore the stored checkpoint
        #[arg(long)]
        full: bool,
    },
    /// Re-dispatch retryable webhook events once
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Loaded configuration");
    }

    match cli.command.unwrap_or(Command::Serve { migrate: false }) {
        Command::Serve { migrate } => {
            let db = db::init_pool(&config).await?;
            if migrate {
                Migrator::up(&db, None).await.context("applying migrations")?;
            }
            run_server(config, db).await
        }
        Command::Migrate => {
            let db = db::init_pool(&config).await?;
            Migrator::up(&db, None).await.context("applying migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Sync {
            owner,
            provider,
            full,
        } => {
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
            with_pipeline(config, |state| async move {
                let summary = state
                    .orchestrator
                    .trigger_sync(OwnerId(owner), provider, mode)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            })
            .await
        }
        Command::Sweep => {
            with_pipeline(config, |state| async move {
                let batch = state.config.dispatch.sweep_batch_size;
                let stats = state.gateway.retry_pending(batch).await?;
                tracing::info!(
                    attempted = stats.attempted,
                    processed = stats.processed,
                    failed = stats.failed,
                    "Sweep finished"
                );
                Ok(())
            })
            .await
        }
    }
}

/// Builds the pipeline, runs `job` against it and stops the dispatcher lanes.
async fn with_pipeline<F, Fut>(config: AppConfig, job: F) -> Result<()>
where
    F: FnOnce(AppState) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let config = Arc::new(config);
    let db = db::init_pool(&config).await?;
    let providers =
        ProviderRegistry::from_config(&config).context("failed to build provider clients")?;
    let shutdown = CancellationToken::new();
    let (state, workers) = AppState::build(config, db, providers, shutdown.clone())?;

    let result = job(state).await;

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    result
}
