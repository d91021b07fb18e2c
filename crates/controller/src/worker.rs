//! Worker pool draining the work queue into a reconciler.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tikvop_core::{classify, ErrorClass, ObjectKey};
use tikvop_store::DedupQueue;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Drives one top-level object towards its desired state.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()>;
}

/// What happened to a key taken off the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Synced,
    Requeued,
    Ignored,
    /// Genuine failure; counted and requeued.
    Failed,
    /// Key could not be parsed; dropped.
    Invalid,
}

/// Take one key, reconcile it and apply the classification policy.
/// Requeues back off per key from `requeue_delay`; success and ignore reset
/// the backoff.
/// Returns `None` once the queue is shut down.
pub async fn process_next_work_item<R: Reconciler + ?Sized>(
    queue: &Arc<DedupQueue>,
    reconciler: &R,
    requeue_delay: Duration,
) -> Option<WorkOutcome> {
    let key = queue.get().await?;
    let started = Instant::now();
    let outcome = match ObjectKey::parse(&key) {
        Err(e) => {
            counter!("handled_errors_total", 1u64);
            error!(key = %key, error = %e, "invalid key; dropping");
            WorkOutcome::Invalid
        }
        Ok(parsed) => match reconciler.reconcile(&parsed).await {
            Ok(()) => {
                debug!(key = %key, "synced");
                queue.forget(&key);
                WorkOutcome::Synced
            }
            Err(e) => match classify(&e) {
                ErrorClass::Requeue => {
                    let delay = queue.add_rate_limited(key.clone(), requeue_delay);
                    info!(key = %key, reason = %e, delay_ms = delay.as_millis() as u64, "requeuing");
                    WorkOutcome::Requeued
                }
                ErrorClass::Ignore => {
                    info!(key = %key, reason = %e, "ignoring");
                    queue.forget(&key);
                    WorkOutcome::Ignored
                }
                ErrorClass::Fault => {
                    counter!("reconcile_errors_total", 1u64);
                    let delay = queue.add_rate_limited(key.clone(), requeue_delay);
                    error!(key = %key, error = %format!("{:#}", e), delay_ms = delay.as_millis() as u64, "reconcile failed; requeuing");
                    WorkOutcome::Failed
                }
            },
        },
    };
    counter!("reconcile_total", 1u64);
    histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    queue.done(&key);
    Some(outcome)
}

/// Spawn `workers` tasks pulling from `queue` until it is shut down.
pub fn run_workers<R: Reconciler>(
    queue: Arc<DedupQueue>,
    reconciler: Arc<R>,
    workers: usize,
    requeue_delay: Duration,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                debug!(worker = id, "worker started");
                while process_next_work_item(&queue, reconciler.as_ref(), requeue_delay).await.is_some() {}
                debug!(worker = id, "worker stopped");
            })
        })
        .collect()
}
