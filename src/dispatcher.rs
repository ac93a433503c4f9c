//! Ordered webhook dispatch
//!
//! Jobs are spread over a fixed set of lanes, each a bounded channel drained by
//! one worker. A job's lane depends only on its `(provider, subject)`, so
//! events for the same repository, project or channel are applied in the order
//! they were received while unrelated subjects proceed in parallel. A job
//! whose subject still has an earlier event awaiting retry is deferred behind
//! it, so a failed delivery is never overtaken by a later one.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::domain::{Activity, OwnerId, Provider};
use crate::store::WebhookLog;
use crate::sync_orchestrator::{ActivitySink, SyncSummary};

/// How a dispatched event ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Processed(SyncSummary),
    /// Delivery failed; the event stays retryable in the webhook log.
    Failed(String),
}

pub type DispatchReceipt = oneshot::Receiver<DispatchOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatch lane {lane} is full")]
    QueueFull { lane: usize },
    #[error("dispatcher is shut down")]
    Closed,
}

struct DispatchJob {
    event_id: Uuid,
    owner_id: OwnerId,
    activity: Activity,
    receipt: oneshot::Sender<DispatchOutcome>,
}

pub struct Dispatcher {
    lanes: Vec<mpsc::Sender<DispatchJob>>,
    enqueue_timeout: Duration,
}

impl Dispatcher {
    /// Spawns one worker per lane. Workers stop when `shutdown` fires; jobs
    /// still queued at that point stay unprocessed in the log for the sweep.
    pub fn start(
        config: &DispatchConfig,
        sink: Arc<dyn ActivitySink>,
        log: Arc<dyn WebhookLog>,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let lane_count = config.lanes.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = Vec::with_capacity(lane_count);

        for lane in 0..lane_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            lanes.push(tx);
            workers.push(tokio::spawn(run_lane(
                lane,
                rx,
                sink.clone(),
                log.clone(),
                config.max_attempts,
                shutdown.clone(),
            )));
        }
        info!(lanes = lane_count, capacity = config.queue_capacity, "Dispatcher started");

        (
            Self {
                lanes,
                enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
            },
            workers,
        )
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_for(&self, provider: Provider, subject: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        provider.hash(&mut hasher);
        subject.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Queues the activity on its subject's lane, waiting at most the enqueue
    /// timeout for capacity.
    pub async fn submit(
        &self,
        event_id: Uuid,
        owner_id: OwnerId,
        activity: Activity,
    ) -> Result<DispatchReceipt, DispatchError> {
        let lane = self.lane_for(activity.provider, &activity.subject);
        let (tx, rx) = oneshot::channel();
        let job = DispatchJob {
            event_id,
            owner_id,
            activity,
            receipt: tx,
        };

        match self.lanes[lane].send_timeout(job, self.enqueue_timeout).await {
            Ok(()) => Ok(rx),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                counter!("webhook_dispatch_rejected_total", "reason" => "full").increment(1);
                Err(DispatchError::QueueFull { lane })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

const WAITING_ON_EARLIER: &str = "waiting for an earlier event on the same subject";

async fn run_lane(
    lane: usize,
    mut jobs: mpsc::Receiver<DispatchJob>,
    sink: Arc<dyn ActivitySink>,
    log: Arc<dyn WebhookLog>,
    max_attempts: u32,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let provider = job.activity.provider;
        let blocked = log
            .has_earlier_pending(job.event_id, &job.activity.subject, max_attempts)
            .await
            .unwrap_or_else(|error| {
                warn!(event_id = %job.event_id, error = %error, "Could not check earlier events on subject");
                false
            });
        if blocked {
            debug!(event_id = %job.event_id, lane, subject = %job.activity.subject, "Deferring behind an earlier event");
            if let Err(error) = log.mark_processed(job.event_id, Some(WAITING_ON_EARLIER)).await {
                warn!(event_id = %job.event_id, error = %error, "Failed to record webhook deferral");
            }
            counter!("webhook_dispatch_total", "provider" => provider.slug(), "outcome" => "deferred")
                .increment(1);
            let _ = job.receipt.send(DispatchOutcome::Failed(WAITING_ON_EARLIER.to_string()));
            continue;
        }

        let outcome = match sink.deliver(job.owner_id, job.activity).await {
            Ok(summary) => {
                if let Err(error) = log.mark_processed(job.event_id, None).await {
                    warn!(event_id = %job.event_id, error = %error, "Failed to mark webhook event processed");
                }
                counter!("webhook_dispatch_total", "provider" => provider.slug(), "outcome" => "processed")
                    .increment(1);
                DispatchOutcome::Processed(summary)
            }
            Err(error) => {
                let message = error.to_string();
                warn!(event_id = %job.event_id, lane, error = %message, "Webhook activity delivery failed");
                if let Err(error) = log.mark_processed(job.event_id, Some(&message)).await {
                    warn!(event_id = %job.event_id, error = %error, "Failed to record webhook dispatch error");
                }
                counter!("webhook_dispatch_total", "provider" => provider.slug(), "outcome" => "failed")
                    .increment(1);
                DispatchOutcome::Failed(message)
            }
        };

        // The submitter may have stopped waiting.
        let _ = job.receipt.send(outcome);
    }
    debug!(lane, "Dispatch lane stopped");
}
