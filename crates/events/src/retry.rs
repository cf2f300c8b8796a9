//! Retry worker: puts failed attempts back on the send queue once their
//! backoff has elapsed, and re-enqueues attempts left `pending` by a
//! previous process or by a send that never reported back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pitchey_core::types::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::queue::{QueueError, SendJob, SendQueue};
use crate::store::{NotificationStore, StoreError};
use crate::tracker::{Change, DeliveryTracker, TrackerError};

pub struct RetryWorker {
    store: Arc<dyn NotificationStore>,
    tracker: Arc<DeliveryTracker>,
    queue: SendQueue,
    batch_size: i64,
    interval: Duration,
    sweep_after: chrono::Duration,
}

impl RetryWorker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        tracker: Arc<DeliveryTracker>,
        queue: SendQueue,
        batch_size: i64,
        interval: Duration,
        sweep_after: Duration,
    ) -> Self {
        Self {
            store,
            tracker,
            queue,
            batch_size: batch_size.max(1),
            interval,
            sweep_after: chrono::Duration::from_std(sweep_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    /// Move failed attempts whose retry time has come back to `pending`
    /// and enqueue them. Stops early when the queue is full; the remaining
    /// attempts are picked up on the next tick.
    pub async fn requeue_due(&self, now: Timestamp) -> Result<usize, StoreError> {
        let due = self.store.list_due_retries(now, self.batch_size).await?;
        let mut requeued = 0;

        for attempt in due {
            let mut reservation = match self.queue.reserve(1).await {
                Ok(r) => r,
                Err(QueueError::Full) => {
                    tracing::warn!("Send queue full, deferring remaining retries");
                    break;
                }
                Err(QueueError::Closed) => break,
            };

            match self.tracker.transition(&attempt, Change::Retry).await {
                Ok(updated) => {
                    reservation.send(SendJob {
                        attempt_id: updated.id,
                    });
                    requeued += 1;
                }
                Err(TrackerError::Conflict(_)) | Err(TrackerError::Terminal(_)) => {
                    tracing::debug!(attempt_id = attempt.id, "Retry skipped, attempt changed");
                }
                Err(TrackerError::Store(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt_id = attempt.id, error = %e, "Retry rejected");
                }
            }
        }

        if requeued > 0 {
            tracing::info!(requeued, "Failed attempts requeued");
        }
        Ok(requeued)
    }

    /// Enqueue every attempt still `pending`, e.g. after a restart. Workers
    /// skip attempts that are no longer pending, so enqueueing twice is
    /// safe.
    pub async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let recovered = self.enqueue_pending(Utc::now()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "Pending attempts re-enqueued");
        }
        Ok(recovered)
    }

    /// Enqueue `pending` attempts untouched for longer than the sweep age,
    /// such as those whose worker lost its store connection mid-send.
    pub async fn sweep_stale(&self, now: Timestamp) -> Result<usize, StoreError> {
        let swept = self.enqueue_pending(now - self.sweep_after).await?;
        if swept > 0 {
            tracing::warn!(swept, "Stale pending attempts re-enqueued");
        }
        Ok(swept)
    }

    /// Page through pending attempts last updated by `cutoff`. Stops when
    /// the queue stays full; the rest are found by a later sweep.
    async fn enqueue_pending(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        let mut after_id = 0;
        let mut enqueued = 0;
        loop {
            let page = self
                .store
                .list_pending_attempts(after_id, cutoff, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            let complete = (page.len() as i64) < self.batch_size;

            for attempt in &page {
                if let Err(e) = self
                    .queue
                    .enqueue(SendJob {
                        attempt_id: attempt.id,
                    })
                    .await
                {
                    tracing::warn!(error = %e, enqueued, "Stopped enqueueing pending attempts");
                    return Ok(enqueued);
                }
                enqueued += 1;
            }

            if complete {
                break;
            }
        }
        Ok(enqueued)
    }

    /// Recover orphans once, then every interval requeue due retries and
    /// sweep stale pending attempts until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(e) = self.recover_orphans().await {
            tracing::error!(error = %e, "Failed to recover pending attempts");
        }

        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_secs = self.interval.as_secs(), "Retry worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retry worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.requeue_due(now).await {
                        tracing::error!(error = %e, "Retry cycle failed");
                    }
                    if let Err(e) = self.sweep_stale(now).await {
                        tracing::error!(error = %e, "Pending sweep failed");
                    }
                }
            }
        }
    }
}
