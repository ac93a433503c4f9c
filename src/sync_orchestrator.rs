//! # Sync Orchestrator
//!
//! Drives paginated backfill and incremental syncs for one connection at a
//! time, feeding each page to the inference engine and committing a
//! checkpoint after every page. Webhook activity enters through
//! [`ActivitySink`].
//!
//! A pass holds a store-backed lease on its connection. Pages are fetched
//! strictly in order; a page is either fully applied and checkpointed or not
//! at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connection_registry::{ConnectionError, ConnectionRegistry};
use crate::domain::{Activity, Connection, Cursor, OwnerId, Provider};
use crate::inference::{InferenceItemError, InferenceOutcome, SkillInferenceEngine};
use crate::providers::ProviderError;
use crate::store::{LeaseStore, StoreError, SyncLease};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Start from the beginning of the provider's history.
    Full,
    /// Resume from the connection's last checkpoint.
    Incremental,
}

/// What one sync pass (or one webhook activity) did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncSummary {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub connection_id: Option<Uuid>,
    pub activities_processed: usize,
    /// Skills whose records changed, sorted and unique.
    pub skills_touched: Vec<String>,
    pub pages_committed: usize,
    /// Cursors committed during this pass, in order.
    pub checkpoints: Vec<Cursor>,
    /// Item-level failures; none of them stopped the pass.
    pub errors: Vec<String>,
    /// Last committed cursor, including the one the pass started from.
    pub last_checkpoint: Option<Cursor>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncSummary {
    pub(crate) fn start(connection_id: Option<Uuid>, from: Option<Cursor>) -> Self {
        Self {
            connection_id,
            activities_processed: 0,
            skills_touched: Vec::new(),
            pages_committed: 0,
            checkpoints: Vec::new(),
            errors: Vec::new(),
            last_checkpoint: from,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn absorb(&mut self, outcome: InferenceOutcome) {
        self.activities_processed += outcome.activities_processed;
        for skill in outcome.skills_touched {
            if let Err(pos) = self.skills_touched.binary_search(&skill) {
                self.skills_touched.insert(pos, skill);
            }
        }
        self.errors
            .extend(outcome.errors.iter().map(ToString::to_string));
    }

    fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running for connection {connection_id}")]
    AlreadyRunning { connection_id: Uuid },

    #[error("owner {owner_id} has no active {provider} connection")]
    NoActiveConnection { owner_id: OwnerId, provider: Provider },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("sync lease store failed: {0}")]
    Lease(#[source] StoreError),

    #[error("sync lease for connection {connection_id} was taken over")]
    LeaseLost { connection_id: Uuid },

    #[error("sync of connection {connection_id} aborted: {source}")]
    Aborted {
        connection_id: Uuid,
        last_checkpoint: Option<Cursor>,
        summary: Box<SyncSummary>,
        source: ProviderError,
    },

    /// A page's evidence could not be stored; its checkpoint was not committed.
    #[error("sync of connection {connection_id} stopped: {source}")]
    StorageFailed {
        connection_id: Uuid,
        last_checkpoint: Option<Cursor>,
        summary: Box<SyncSummary>,
        source: InferenceItemError,
    },

    #[error("sync of connection {connection_id} cancelled")]
    Cancelled {
        connection_id: Uuid,
        summary: Box<SyncSummary>,
    },

    /// Storing evidence or records failed; the activity may be retried.
    #[error("activity could not be applied: {0}")]
    Inference(InferenceItemError),
}

impl SyncError {
    /// Partial progress carried by aborted and cancelled passes.
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            SyncError::Aborted { summary, .. }
            | SyncError::StorageFailed { summary, .. }
            | SyncError::Cancelled { summary, .. } => {
                Some(summary.as_ref())
            }
            _ => None,
        }
    }
}

/// Destination for webhook activities once their owner is known.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn deliver(&self, owner_id: OwnerId, activity: Activity)
    -> Result<SyncSummary, SyncError>;
}

/// Releases the lease when dropped without an explicit release, for example
/// when the pass future itself is dropped.
struct LeaseGuard {
    leases: Arc<dyn LeaseStore>,
    lease: Option<SyncLease>,
}

impl LeaseGuard {
    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(error) = self.leases.release(&lease).await {
                warn!(connection_id = %lease.connection_id, error = %error, "Failed to release sync lease");
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let leases = self.leases.clone();
            handle.spawn(async move {
                if let Err(error) = leases.release(&lease).await {
                    warn!(connection_id = %lease.connection_id, error = %error, "Failed to release sync lease");
                }
            });
        }
    }
}

pub struct SyncOrchestrator {
    connections: Arc<ConnectionRegistry>,
    leases: Arc<dyn LeaseStore>,
    engine: Arc<SkillInferenceEngine>,
    lease_ttl: Duration,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        leases: Arc<dyn LeaseStore>,
        engine: Arc<SkillInferenceEngine>,
        lease_ttl: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connections,
            leases,
            engine,
            lease_ttl,
            shutdown,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Syncs the connection's whole history, ignoring any stored checkpoint.
    pub async fn full_sync(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        self.run_pass(connection, None, cancel).await
    }

    /// Syncs from `since_cursor`, or from the stored checkpoint when `None`.
    pub async fn incremental_sync(
        &self,
        connection: &Connection,
        since_cursor: Option<Cursor>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let start = since_cursor.or_else(|| connection.last_sync_cursor.clone());
        self.run_pass(connection, start, cancel).await
    }

    /// Manual trigger: syncs the owner's active connection for `provider`.
    #[instrument(skip(self), fields(owner_id = %owner_id, provider = %provider))]
    pub async fn trigger_sync(
        &self,
        owner_id: OwnerId,
        provider: Provider,
        mode: SyncMode,
    ) -> Result<SyncSummary, SyncError> {
        let connection = self
            .connections
            .get_active(owner_id, provider)
            .await?
            .ok_or(SyncError::NoActiveConnection { owner_id, provider })?;

        let cancel = self.shutdown.child_token();
        match mode {
            SyncMode::Full => self.full_sync(&connection, &cancel).await,
            SyncMode::Incremental => self.incremental_sync(&connection, None, &cancel).await,
        }
    }

    /// Fast path for a single webhook activity; no lease, no pagination.
    #[instrument(skip_all, fields(owner_id = %owner_id, activity = %activity.key()))]
    pub async fn handle_webhook_activity(
        &self,
        owner_id: OwnerId,
        activity: Activity,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::start(None, None);
        let outcome = self
            .engine
            .apply(owner_id, std::slice::from_ref(&activity), Utc::now())
            .await;

        if let Some(storage) = outcome.storage_failure() {
            return Err(SyncError::Inference(storage.clone()));
        }

        summary.absorb(outcome);
        counter!("webhook_activities_applied_total", "provider" => activity.provider.slug())
            .increment(1);
        Ok(summary.finish())
    }

    #[instrument(skip_all, fields(connection_id = %connection.id, provider = %connection.provider))]
    async fn run_pass(
        &self,
        connection: &Connection,
        start: Option<Cursor>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let started = Instant::now();
        let lease = self
            .leases
            .try_acquire(connection.id, self.lease_ttl)
            .await
            .map_err(SyncError::Lease)?
            .ok_or(SyncError::AlreadyRunning {
                connection_id: connection.id,
            })?;
        let guard = LeaseGuard {
            leases: self.leases.clone(),
            lease: Some(lease.clone()),
        };

        info!(resume_from = ?start, "Sync pass started");
        let result = self.paginate(connection, start, &lease, cancel).await;
        guard.release().await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(SyncError::Cancelled { .. }) => "cancelled",
            Err(SyncError::StorageFailed { .. }) => "storage_failure",
            Err(_) => "failure",
        };
        histogram!("sync_pass_duration_ms", "provider" => connection.provider.slug())
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        counter!("sync_passes_total", "provider" => connection.provider.slug(), "outcome" => outcome)
            .increment(1);

        match &result {
            Ok(summary) => info!(
                pages = summary.pages_committed,
                activities = summary.activities_processed,
                skills = summary.skills_touched.len(),
                item_errors = summary.errors.len(),
                "Sync pass finished"
            ),
            Err(error) => warn!(error = %error, "Sync pass stopped"),
        }
        result
    }

    async fn paginate(
        &self,
        connection: &Connection,
        start: Option<Cursor>,
        lease: &SyncLease,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::start(Some(connection.id), start.clone());

        let adapter = self
            .connections
            .providers()
            .get(connection.provider)
            .map_err(|_| ConnectionError::UnknownProvider(connection.provider))?;
        let mut connection = self.connections.refresh_if_needed(connection).await?;
        let mut client = match adapter.authenticate(&connection).await {
            Ok(client) => client,
            Err(error) => return Err(aborted(connection.id, summary, error)),
        };

        let mut cursor = start;
        let mut auth_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(connection.id, summary));
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(connection.id, summary)),
                page = adapter.list_activity_since(&client, cursor.as_ref()) => page,
            };

            let page = match fetched {
                Ok(page) => page,
                Err(ProviderError::Auth(reason)) if !auth_retried => {
                    debug!(reason = %reason, "Provider rejected credential; refreshing once");
                    auth_retried = true;
                    connection = match self.connections.force_refresh(&connection).await {
                        Ok(refreshed) => refreshed,
                        Err(error) => {
                            return Err(aborted(
                                connection.id,
                                summary,
                                ProviderError::Auth(error.to_string()),
                            ));
                        }
                    };
                    client = match adapter.authenticate(&connection).await {
                        Ok(client) => client,
                        Err(error) => return Err(aborted(connection.id, summary, error)),
                    };
                    continue;
                }
                Err(error) => {
                    if let ProviderError::Auth(reason) = &error {
                        if let Err(mark) = self.connections.mark_error(connection.id, reason).await
                        {
                            warn!(error = %mark, "Failed to mark connection error");
                        }
                    }
                    return Err(aborted(connection.id, summary, error));
                }
            };
            auth_retried = false;

            let outcome = self
                .engine
                .apply(connection.owner_id, &page.activities, Utc::now())
                .await;
            if let Some(storage) = outcome.storage_failure() {
                return Err(SyncError::StorageFailed {
                    connection_id: connection.id,
                    last_checkpoint: summary.last_checkpoint.clone(),
                    source: storage.clone(),
                    summary: Box::new(summary.finish()),
                });
            }
            summary.absorb(outcome);

            if let Some(next) = page.next_cursor {
                self.connections.record_checkpoint(connection.id, &next).await?;
                summary.checkpoints.push(next.clone());
                summary.last_checkpoint = Some(next.clone());
                cursor = Some(next);
            }
            summary.pages_committed += 1;
            counter!("sync_pages_committed_total", "provider" => connection.provider.slug())
                .increment(1);
            debug!(
                page = summary.pages_committed,
                activities = page.activities.len(),
                has_more = page.has_more,
                "Page committed"
            );

            match self.leases.renew(lease, self.lease_ttl).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(SyncError::LeaseLost {
                        connection_id: connection.id,
                    });
                }
                Err(error) => return Err(SyncError::Lease(error)),
            }

            if !page.has_more {
                return Ok(summary.finish());
            }
        }
    }
}

fn aborted(connection_id: Uuid, summary: SyncSummary, source: ProviderError) -> SyncError {
    SyncError::Aborted {
        connection_id,
        last_checkpoint: summary.last_checkpoint.clone(),
        summary: Box::new(summary.finish()),
        source,
    }
}

fn cancelled(connection_id: Uuid, summary: SyncSummary) -> SyncError {
    SyncError::Cancelled {
        connection_id,
        summary: Box::new(summary.finish()),
    }
}

#[async_trait]
impl ActivitySink for SyncOrchestrator {
    async fn deliver(
        &self,
        owner_id: OwnerId,
        activity: Activity,
    ) -> Result<SyncSummary, SyncError> {
        self.handle_webhook_activity(owner_id, activity).await
    }
}
