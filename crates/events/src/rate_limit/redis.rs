//! Redis-backed rate limit store.
//!
//! Each primitive is a single Lua script, so the read-modify-write runs
//! atomically on the Redis server and the counters are shared by every
//! engine node. This store is authoritative whenever `REDIS_URL` is set.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use deadpool_redis::redis;
use deadpool_redis::Pool;
use pitchey_core::types::Timestamp;

use super::{RateLimitStore, RateLimitStoreError, SlidingOutcome};

/// `INCR` the counter, set its expiry on first use and undo the increment
/// when the limit is exceeded. Returns 1 when admitted, 0 when denied.
const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
if current > tonumber(ARGV[1]) then
  redis.call('DECR', KEYS[1])
  return 0
end
return 1
"#;

/// Release one increment without letting the counter go negative.
const RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  redis.call('DECR', KEYS[1])
end
return 1
"#;

/// Trim the sorted-set log to the window, then admit if there is room.
/// Returns -1 when admitted, otherwise the oldest entry's score (ms).
const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  return -1
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if oldest[2] == nil then
  return now
end
return tonumber(oldest[2])
"#;

/// Shared counters in Redis.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    pool: Pool,
}

impl RedisRateLimitStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self, RateLimitStoreError> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| RateLimitStoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, RateLimitStoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| RateLimitStoreError::Pool(e.to_string()))
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn incr_fixed(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
        _now: Timestamp,
    ) -> Result<bool, RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let admitted: i64 = redis::cmd("EVAL")
            .arg(FIXED_WINDOW_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(limit)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitStoreError::Command(e.to_string()))?;
        Ok(admitted == 1)
    }

    async fn release_fixed(&self, key: &str) -> Result<(), RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitStoreError::Command(e.to_string()))?;
        Ok(())
    }

    async fn record_sliding(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<SlidingOutcome, RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let now_ms = now.timestamp_millis();
        // Unique member so two sends in the same millisecond both count.
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let reply: i64 = redis::cmd("EVAL")
            .arg(SLIDING_WINDOW_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(now_ms)
            .arg(millis(window))
            .arg(limit)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitStoreError::Command(e.to_string()))?;

        if reply < 0 {
            return Ok(SlidingOutcome::Admitted);
        }
        let oldest = Utc
            .timestamp_millis_opt(reply)
            .single()
            .ok_or_else(|| RateLimitStoreError::Reply(format!("invalid score {reply}")))?;
        Ok(SlidingOutcome::Rejected { oldest })
    }

    async fn health_check(&self) -> Result<(), RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitStoreError::Command(e.to_string()))?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(10)), 10_000);
    }
}
