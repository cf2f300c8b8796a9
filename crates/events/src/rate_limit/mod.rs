//! Per-user, per-channel rate limiting.
//!
//! [`RateLimiter`] enforces two windows for every `(user, channel)` pair on
//! top of a [`RateLimitStore`]: an hourly fixed-window counter and a short
//! sliding burst log. Each window is checked with one atomic store
//! primitive. When the hourly window admits a send but the burst window
//! rejects it, the hourly increment is released again.
//!
//! Store failures and timeouts fail open: the send is allowed and a warning
//! is logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::rate_limit::{
    burst_key, fixed_window_retry_after, fixed_window_start, hourly_key,
    sliding_window_retry_after, RateLimitDecision, WindowKind,
};
use pitchey_core::types::{DbId, Timestamp};

use crate::config::ChannelPolicies;

pub mod memory;
pub mod redis;

pub use memory::MemoryRateLimitStore;
pub use redis::RedisRateLimitStore;

/// Failure of the counter backend. Never surfaced to callers of
/// [`RateLimiter`].
#[derive(Debug, thiserror::Error)]
pub enum RateLimitStoreError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Unexpected script reply: {0}")]
    Reply(String),
}

/// Result of recording an entry in a sliding log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingOutcome {
    Admitted,
    /// The log is full; `oldest` is the earliest entry still in the window.
    Rejected { oldest: Timestamp },
}

/// Atomic counters with expiry.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment the fixed-window counter at `key`, setting its expiry to
    /// `ttl` on creation. If the new value exceeds `limit` the increment is
    /// undone and `false` is returned.
    async fn incr_fixed(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, RateLimitStoreError>;

    /// Undo one admitted fixed-window increment.
    async fn release_fixed(&self, key: &str) -> Result<(), RateLimitStoreError>;

    /// Drop entries at or before `now - window` from the log at `key`, then
    /// append `now` if fewer than `limit` entries remain.
    async fn record_sliding(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<SlidingOutcome, RateLimitStoreError>;

    /// Remove expired buckets. Backends with native expiry return 0.
    async fn reap_expired(&self, _now: Timestamp) -> usize {
        0
    }

    async fn health_check(&self) -> Result<(), RateLimitStoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

/// Checks and consumes rate limit budget for outgoing sends.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: ChannelPolicies,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policies: ChannelPolicies, timeout: Duration) -> Self {
        Self {
            store,
            policies,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Enforce both windows for one send happening now.
    pub async fn check_and_increment(&self, user_id: DbId, channel: Channel) -> RateLimitDecision {
        self.check_at(user_id, channel, Utc::now()).await
    }

    /// Enforce both windows for one send at `now`.
    pub async fn check_at(&self, user_id: DbId, channel: Channel, now: Timestamp) -> RateLimitDecision {
        let hourly = match self.check_window(user_id, channel, WindowKind::Hourly, now).await {
            WindowCheck::Denied(decision) => return decision,
            other => other,
        };

        match self.check_window(user_id, channel, WindowKind::Burst, now).await {
            WindowCheck::Denied(decision) => {
                if let WindowCheck::Counted { key } = hourly {
                    self.release(&key, user_id, channel).await;
                }
                decision
            }
            _ => RateLimitDecision::allow(),
        }
    }

    /// Enforce a single window.
    pub async fn check_and_increment_window(
        &self,
        user_id: DbId,
        channel: Channel,
        kind: WindowKind,
        now: Timestamp,
    ) -> RateLimitDecision {
        match self.check_window(user_id, channel, kind, now).await {
            WindowCheck::Denied(decision) => decision,
            _ => RateLimitDecision::allow(),
        }
    }

    async fn check_window(
        &self,
        user_id: DbId,
        channel: Channel,
        kind: WindowKind,
        now: Timestamp,
    ) -> WindowCheck {
        let (limit, window) = self.policies.get(channel).window(kind);

        match kind {
            WindowKind::Hourly => {
                let key = hourly_key(user_id, channel, fixed_window_start(now, window));
                let retry_after = fixed_window_retry_after(now, window);
                // Keep the key a little past the window end to absorb clock skew.
                let ttl = retry_after + Duration::from_secs(1);
                let call = self.store.incr_fixed(&key, limit, ttl, now);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(Ok(true)) => WindowCheck::Counted { key },
                    Ok(Ok(false)) => {
                        tracing::debug!(user_id, %channel, window = %kind, "Rate limit reached");
                        WindowCheck::Denied(RateLimitDecision::deny(kind, retry_after))
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(user_id, %channel, window = %kind, error = %e, "Rate limit store error, allowing send");
                        WindowCheck::FailedOpen
                    }
                    Err(_) => {
                        tracing::warn!(user_id, %channel, window = %kind, "Rate limit store timed out, allowing send");
                        WindowCheck::FailedOpen
                    }
                }
            }
            WindowKind::Burst => {
                let key = burst_key(user_id, channel);
                let call = self.store.record_sliding(&key, limit, window, now);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(Ok(SlidingOutcome::Admitted)) => WindowCheck::Counted { key },
                    Ok(Ok(SlidingOutcome::Rejected { oldest })) => {
                        tracing::debug!(user_id, %channel, window = %kind, "Burst limit reached");
                        let retry_after = sliding_window_retry_after(oldest, now, window);
                        WindowCheck::Denied(RateLimitDecision::deny(kind, retry_after))
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(user_id, %channel, window = %kind, error = %e, "Rate limit store error, allowing send");
                        WindowCheck::FailedOpen
                    }
                    Err(_) => {
                        tracing::warn!(user_id, %channel, window = %kind, "Rate limit store timed out, allowing send");
                        WindowCheck::FailedOpen
                    }
                }
            }
        }
    }

    async fn release(&self, key: &str, user_id: DbId, channel: Channel) {
        match tokio::time::timeout(self.timeout, self.store.release_fixed(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(user_id, %channel, error = %e, "Failed to release hourly increment");
            }
            Err(_) => {
                tracing::warn!(user_id, %channel, "Timed out releasing hourly increment");
            }
        }
    }
}

enum WindowCheck {
    Counted { key: String },
    Denied(RateLimitDecision),
    FailedOpen,
}
