//! In-process rate limit store.
//!
//! Buckets are spread over a fixed number of independently locked shards;
//! each check runs entirely under its shard's mutex, which makes it atomic
//! with respect to every other check on the same key. Expired buckets are
//! removed by [`reap_expired`](RateLimitStore::reap_expired), driven by a
//! background task.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use pitchey_core::types::Timestamp;
use tokio::sync::Mutex;

use super::{RateLimitStore, RateLimitStoreError, SlidingOutcome};

/// Number of independently locked shards.
pub const SHARD_COUNT: usize = 16;

enum Bucket {
    Counter {
        count: u32,
        expires_at: Timestamp,
    },
    Log {
        entries: VecDeque<Timestamp>,
        window: chrono::Duration,
    },
}

impl Bucket {
    fn is_expired(&self, now: Timestamp) -> bool {
        match self {
            Bucket::Counter { expires_at, .. } => *expires_at <= now,
            Bucket::Log { entries, window } => entries
                .back()
                .map_or(true, |newest| *newest <= now - *window),
        }
    }
}

/// Sharded in-memory counters for single-node deployments and tests.
pub struct MemoryRateLimitStore {
    shards: Vec<Mutex<HashMap<String, Bucket>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Bucket>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Number of live buckets across all shards.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn incr_fixed(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<bool, RateLimitStoreError> {
        let mut shard = self.shard(key).lock().await;
        let bucket = shard.entry(key.to_string()).or_insert(Bucket::Counter {
            count: 0,
            expires_at: now + to_chrono(ttl),
        });
        if bucket.is_expired(now) || !matches!(bucket, Bucket::Counter { .. }) {
            *bucket = Bucket::Counter {
                count: 0,
                expires_at: now + to_chrono(ttl),
            };
        }
        let Bucket::Counter { count, .. } = bucket else {
            return Err(RateLimitStoreError::Reply(format!("{key} is not a counter")));
        };
        if *count >= limit {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn release_fixed(&self, key: &str) -> Result<(), RateLimitStoreError> {
        let mut shard = self.shard(key).lock().await;
        if let Some(Bucket::Counter { count, .. }) = shard.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn record_sliding(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<SlidingOutcome, RateLimitStoreError> {
        let window = to_chrono(window);
        let mut shard = self.shard(key).lock().await;
        let bucket = shard.entry(key.to_string()).or_insert_with(|| Bucket::Log {
            entries: VecDeque::new(),
            window,
        });
        if !matches!(bucket, Bucket::Log { .. }) {
            *bucket = Bucket::Log {
                entries: VecDeque::new(),
                window,
            };
        }
        let Bucket::Log {
            entries,
            window: stored_window,
        } = bucket
        else {
            return Err(RateLimitStoreError::Reply(format!("{key} is not a log")));
        };
        *stored_window = window;

        let cutoff = now - window;
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
        if entries.len() < limit as usize {
            entries.push_back(now);
            return Ok(SlidingOutcome::Admitted);
        }
        match entries.front() {
            Some(oldest) => Ok(SlidingOutcome::Rejected { oldest: *oldest }),
            // limit == 0 with an empty log
            None => Ok(SlidingOutcome::Rejected { oldest: now }),
        }
    }

    async fn reap_expired(&self, now: Timestamp) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut buckets = shard.lock().await;
            let before = buckets.len();
            buckets.retain(|_, bucket| !bucket.is_expired(now));
            removed += before - buckets.len();
        }
        removed
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn counter_denies_past_limit_without_counting() {
        let store = MemoryRateLimitStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.incr_fixed("k", 1, ttl, at(0)).await.unwrap());
        assert!(!store.incr_fixed("k", 1, ttl, at(1)).await.unwrap());
        store.release_fixed("k").await.unwrap();
        assert!(store.incr_fixed("k", 1, ttl, at(2)).await.unwrap());
    }

    #[tokio::test]
    async fn counter_resets_after_expiry() {
        let store = MemoryRateLimitStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.incr_fixed("k", 1, ttl, at(0)).await.unwrap());
        assert!(store.incr_fixed("k", 1, ttl, at(10)).await.unwrap());
    }

    #[tokio::test]
    async fn reaper_removes_only_expired_buckets() {
        let store = MemoryRateLimitStore::new();
        store
            .incr_fixed("old", 5, Duration::from_secs(10), at(0))
            .await
            .unwrap();
        store
            .incr_fixed("new", 5, Duration::from_secs(10), at(100))
            .await
            .unwrap();
        store
            .record_sliding("log", 5, Duration::from_secs(10), at(0))
            .await
            .unwrap();

        assert_eq!(store.reap_expired(at(50)).await, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_increments_never_exceed_limit() {
        let store = std::sync::Arc::new(MemoryRateLimitStore::new());
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_fixed("shared", 10, Duration::from_secs(60), at(0))
                    .await
                    .unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
