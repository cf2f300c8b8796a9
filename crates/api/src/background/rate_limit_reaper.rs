//! Periodic cleanup of expired in-process rate limit buckets.
//!
//! Only needed for the in-memory counter store; Redis expires keys itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pitchey_events::RateLimitStore;
use tokio_util::sync::CancellationToken;

/// Run the reaper loop until `cancel` is triggered.
pub async fn run(store: Arc<dyn RateLimitStore>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        backend = store.backend(),
        "Rate limit reaper started"
    );

    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Rate limit reaper stopping");
                break;
            }
            _ = interval.tick() => {
                let reaped = store.reap_expired(Utc::now()).await;
                if reaped > 0 {
                    tracing::debug!(reaped, "Rate limit reaper: dropped expired buckets");
                }
            }
        }
    }
}
