//! # Token Refresh Service
//!
//! Background task that periodically scans active connections and refreshes
//! credentials nearing expiry, so syncs and webhooks rarely meet an expired
//! token. Refreshes go through [`ConnectionRegistry`] and share its
//! single-flight protection with on-demand refreshes.

use std::sync::Arc;

use chrono::Duration;
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::TokenRefreshConfig;
use crate::connection_registry::{ConnectionError, ConnectionRegistry};

#[derive(Clone)]
pub struct TokenRefreshService {
    config: TokenRefreshConfig,
    registry: Arc<ConnectionRegistry>,
}

/// Counts from one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    pub connections_polled: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
}

impl TokenRefreshService {
    pub fn new(config: TokenRefreshConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Run the token refresh loop until the provided shutdown token fires
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.tick_seconds,
            "Starting token refresh service"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Token refresh tick failed");
                    }
                    histogram!("token_refresh_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// Execute one tick: refresh every connection expiring within the lead time.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> Result<RefreshStats, ConnectionError> {
        let lead_time = Duration::seconds(self.config.lead_time_seconds as i64);
        let due = self
            .registry
            .list_expiring(lead_time, self.config.batch_size)
            .await?;

        let mut stats = RefreshStats {
            connections_polled: due.len() as u64,
            ..RefreshStats::default()
        };
        debug!(
            found_connections = due.len(),
            lead_time_seconds = self.config.lead_time_seconds,
            "Found connections due for token refresh"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(due.len());

        for connection in due {
            let semaphore = semaphore.clone();
            let registry = self.registry.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                // The lead time is wider than the registry's margin, so force it.
                registry.force_refresh(&connection).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => stats.refreshes_succeeded += 1,
                Ok(Err(e)) => {
                    stats.refreshes_failed += 1;
                    error!(error = %e, "Connection refresh failed");
                }
                Err(e) => {
                    stats.refreshes_failed += 1;
                    error!(error = ?e, "Refresh task panicked or was cancelled");
                }
            }
        }

        gauge!("token_refresh_connections_polled").set(stats.connections_polled as f64);
        counter!("token_refresh_attempts_total").increment(stats.connections_polled);
        counter!("token_refresh_success_total").increment(stats.refreshes_succeeded);
        counter!("token_refresh_failure_total").increment(stats.refreshes_failed);

        debug!(
            connections_polled = stats.connections_polled,
            refreshes_succeeded = stats.refreshes_succeeded,
            refreshes_failed = stats.refreshes_failed,
            "Token refresh tick completed"
        );

        Ok(stats)
    }
}
