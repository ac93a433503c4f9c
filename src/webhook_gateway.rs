//! # Webhook Ingestion Gateway
//!
//! Accepts provider webhooks, deduplicates them by delivery id, verifies
//! signatures, logs every verified delivery and hands normalized activity to
//! the [`Dispatcher`]. Events whose dispatch fails stay in the log and are
//! retried by the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dispatcher::{DispatchOutcome, DispatchReceipt, Dispatcher};
use crate::domain::{Provider, WebhookEnvelope, WebhookEvent};
use crate::providers::{ProviderAdapter, ProviderRegistry};
use crate::store::{ConnectionStore, StoreError, WebhookLog};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("invalid webhook payload: {0}")]
    Validation(String),
    #[error("webhook signature rejected for {provider}")]
    SignatureRejected { provider: Provider },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// Logged and queued; the receipt completes once the activity is applied.
    Dispatched {
        event_id: Uuid,
        receipt: DispatchReceipt,
    },
    /// Logged without dispatch: ignored event type, unknown actor, or a full
    /// queue left for the retry sweep.
    Accepted {
        event_id: Uuid,
        reason: AcceptReason,
    },
    /// Already logged; nothing was done.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    /// The event type carries no tracked activity.
    Ignored,
    /// No active connection matches the actor.
    Unattributed,
    /// The dispatch queue was unavailable; the sweep will retry.
    Deferred,
}

/// Counts from one retry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryStats {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
}

pub struct WebhookGateway {
    providers: ProviderRegistry,
    secrets: HashMap<Provider, String>,
    connections: Arc<dyn ConnectionStore>,
    log: Arc<dyn WebhookLog>,
    dispatcher: Arc<Dispatcher>,
    max_attempts: u32,
    sweep_interval: Duration,
    sweep_batch_size: u64,
}

impl WebhookGateway {
    pub fn new(
        config: &AppConfig,
        providers: ProviderRegistry,
        connections: Arc<dyn ConnectionStore>,
        log: Arc<dyn WebhookLog>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let secrets = Provider::ALL
            .into_iter()
            .filter_map(|p| config.webhook_secret(p).map(|s| (p, s.to_string())))
            .collect();
        Self {
            providers,
            secrets,
            connections,
            log,
            dispatcher,
            max_attempts: config.dispatch.max_attempts,
            sweep_interval: Duration::from_secs(config.dispatch.sweep_interval_seconds.max(1)),
            sweep_batch_size: config.dispatch.sweep_batch_size,
        }
    }

    fn adapter(&self, provider: &str) -> Result<(Provider, Arc<dyn ProviderAdapter>), GatewayError> {
        let provider: Provider = provider
            .parse()
            .map_err(|_| GatewayError::UnknownProvider(provider.to_string()))?;
        let adapter = self
            .providers
            .get(provider)
            .map_err(|_| GatewayError::UnknownProvider(provider.to_string()))?;
        Ok((provider, adapter))
    }

    /// Signature check alone, without logging or dispatch. A provider with no
    /// configured secret never verifies.
    pub fn verify(
        &self,
        provider: &str,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<(), GatewayError> {
        let (provider, adapter) = self.adapter(provider)?;
        if self.signature_valid(provider, adapter.as_ref(), headers, raw_body) {
            Ok(())
        } else {
            Err(GatewayError::SignatureRejected { provider })
        }
    }

    fn signature_valid(
        &self,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> bool {
        self.secrets
            .get(&provider)
            .is_some_and(|secret| adapter.verify_webhook_signature(raw_body, headers, secret))
    }

    #[instrument(skip_all, fields(provider = %provider, delivery_id))]
    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<IngestOutcome, GatewayError> {
        let (provider, adapter) = self.adapter(provider)?;

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| GatewayError::Validation(format!("body is not JSON: {e}")))?;
        let envelope = adapter
            .webhook_envelope(headers, &payload)
            .map_err(|e| GatewayError::Validation(e.to_string()))?;
        tracing::Span::current().record("delivery_id", envelope.delivery_id.as_str());

        if self.log.exists(provider, &envelope.delivery_id).await? {
            debug!("Duplicate delivery");
            record(provider, "duplicate");
            return Ok(IngestOutcome::Duplicate);
        }

        if !self.signature_valid(provider, adapter.as_ref(), headers, raw_body) {
            let reason = if self.secrets.contains_key(&provider) {
                "signature verification failed"
            } else {
                "no webhook secret configured"
            };
            warn!(reason, "Rejecting webhook");
            let rejected = WebhookEvent::rejected(provider, &envelope, payload, reason);
            match self.log.append(&rejected).await {
                Ok(()) | Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
            record(provider, "rejected");
            return Err(GatewayError::SignatureRejected { provider });
        }

        let event = WebhookEvent::received(provider, &envelope, payload);
        match self.log.append(&event).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                record(provider, "duplicate");
                return Ok(IngestOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = self.process(provider, adapter.as_ref(), &event).await;
        record(
            provider,
            match &outcome {
                Ok(IngestOutcome::Dispatched { .. }) => "dispatched",
                Ok(_) => "accepted",
                Err(_) => "invalid",
            },
        );
        outcome
    }

    /// Normalize, attribute and dispatch one logged event.
    async fn process(
        &self,
        provider: Provider,
        adapter: &dyn ProviderAdapter,
        event: &WebhookEvent,
    ) -> Result<IngestOutcome, GatewayError> {
        let envelope = WebhookEnvelope {
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type.clone(),
            action: event.action.clone(),
        };

        let draft = match adapter.normalize_webhook_payload(&envelope, &event.raw_payload) {
            Ok(Some(draft)) => draft,
            Ok(None) => {
                debug!(event_type = %event.event_type, "Event type not tracked");
                self.log.mark_processed(event.id, None).await?;
                return Ok(IngestOutcome::Accepted {
                    event_id: event.id,
                    reason: AcceptReason::Ignored,
                });
            }
            Err(error) => {
                let reason = error.to_string();
                self.log.mark_rejected(event.id, &reason).await?;
                return Err(GatewayError::Validation(reason));
            }
        };

        self.log.set_subject(event.id, &draft.subject).await?;

        let Some(connection) = self
            .connections
            .find_active_by_account(provider, &draft.actor_account_id)
            .await?
        else {
            info!(actor = %draft.actor_account_id, "No active connection for webhook actor");
            self.log.mark_processed(event.id, None).await?;
            return Ok(IngestOutcome::Accepted {
                event_id: event.id,
                reason: AcceptReason::Unattributed,
            });
        };

        let activity = draft.attribute_to(connection.owner_id);
        match self
            .dispatcher
            .submit(event.id, connection.owner_id, activity)
            .await
        {
            Ok(receipt) => Ok(IngestOutcome::Dispatched {
                event_id: event.id,
                receipt,
            }),
            Err(error) => {
                warn!(error = %error, "Dispatch queue unavailable; leaving event for retry");
                self.log
                    .mark_processed(event.id, Some(&error.to_string()))
                    .await?;
                Ok(IngestOutcome::Accepted {
                    event_id: event.id,
                    reason: AcceptReason::Deferred,
                })
            }
        }
    }

    /// Re-dispatches retryable events oldest first and waits for each to
    /// finish, so an event only runs once the earlier ones on its subject have
    /// been applied or given up.
    #[instrument(skip(self))]
    pub async fn retry_pending(&self, limit: u64) -> Result<RetryStats, GatewayError> {
        let pending = self.log.list_retryable(self.max_attempts, limit).await?;
        let mut stats = RetryStats::default();

        for event in pending {
            stats.attempted += 1;
            let adapter = match self.providers.get(event.provider) {
                Ok(adapter) => adapter,
                Err(error) => {
                    self.log.mark_rejected(event.id, &error.to_string()).await?;
                    stats.failed += 1;
                    continue;
                }
            };

            match self.process(event.provider, adapter.as_ref(), &event).await {
                Ok(IngestOutcome::Dispatched { receipt, .. }) => match receipt.await {
                    Ok(DispatchOutcome::Processed(_)) => stats.processed += 1,
                    Ok(DispatchOutcome::Failed(_)) | Err(_) => stats.failed += 1,
                },
                Ok(IngestOutcome::Accepted {
                    reason: AcceptReason::Deferred,
                    ..
                }) => stats.failed += 1,
                Ok(_) => stats.processed += 1,
                Err(error) => {
                    debug!(event_id = %event.id, error = %error, "Retried event rejected");
                    stats.failed += 1;
                }
            }
        }

        if stats.attempted > 0 {
            info!(
                attempted = stats.attempted,
                processed = stats.processed,
                failed = stats.failed,
                "Webhook retry sweep finished"
            );
        }
        counter!("webhook_retries_total", "outcome" => "processed").increment(stats.processed as u64);
        counter!("webhook_retries_total", "outcome" => "failed").increment(stats.failed as u64);
        Ok(stats)
    }

    /// Runs [`Self::retry_pending`] on the sweep interval until cancelled.
    pub async fn run_retry_sweeper(&self, cancel: CancellationToken) {
        info!(interval_seconds = self.sweep_interval.as_secs(), "Starting webhook retry sweeper");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.sweep_interval) => {
                    if let Err(error) = self.retry_pending(self.sweep_batch_size).await {
                        warn!(error = %error, "Webhook retry sweep failed");
                    }
                }
            }
        }
        info!("Webhook retry sweeper stopped");
    }
}

fn record(provider: Provider, outcome: &'static str) {
    counter!("webhook_events_total", "provider" => provider.slug(), "outcome" => outcome).increment(1);
}
