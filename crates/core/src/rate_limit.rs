//! Rate-limit windows, decisions and per-channel policy.
//!
//! Two windows are enforced per `(user, channel)`:
//!
//! - **hourly**: a fixed window counter aligned to the hour.
//! - **burst**: a short sliding window protecting downstream providers.
//!
//! The stores that hold the counters live in the engine crate; this module
//! only owns the arithmetic and the key layout so every backend agrees.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::Channel;
use crate::types::{DbId, Timestamp};

/// Length of the hourly window.
pub const HOURLY_WINDOW: Duration = Duration::from_secs(3600);

/// Default length of the burst window.
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(10);

/// Default burst limit applied to every channel.
pub const DEFAULT_BURST_LIMIT: u32 = 5;

/// Which of the two windows a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hourly,
    Burst,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowKind::Hourly => "hourly",
            WindowKind::Burst => "burst",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a check-and-increment. Denial is a control signal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Time until the denying window frees a slot; zero when allowed.
    #[serde(rename = "retryAfter", serialize_with = "serialize_secs")]
    pub retry_after: Duration,
    /// The window that denied the send, if any.
    #[serde(skip)]
    pub denied_by: Option<WindowKind>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            denied_by: None,
        }
    }

    pub fn deny(kind: WindowKind, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            denied_by: Some(kind),
        }
    }

    /// `retry_after` rounded up to whole seconds for the wire contract.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(ceil_secs(*d))
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Typed per-channel configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// Disabled channels are never dispatched, whatever the preferences say.
    pub enabled: bool,
    pub hourly_limit: u32,
    pub burst_limit: u32,
    pub burst_window: Duration,
    /// Rate-limited sends are deferred into the user's digest instead of
    /// being recorded as `rate_limited`.
    pub digest_fallback: bool,
}

impl ChannelPolicy {
    /// Platform defaults: email 10/h, in-app 20/h, SMS 5/h, push 50/h,
    /// webhook 30/h, burst 5 per 10 s. Only email falls back to the digest.
    pub fn default_for(channel: Channel) -> Self {
        let hourly_limit = match channel {
            Channel::Email => 10,
            Channel::InApp => 20,
            Channel::Sms => 5,
            Channel::Push => 50,
            Channel::Webhook => 30,
        };
        Self {
            enabled: true,
            hourly_limit,
            burst_limit: DEFAULT_BURST_LIMIT,
            burst_window: DEFAULT_BURST_WINDOW,
            digest_fallback: channel == Channel::Email,
        }
    }

    /// Limit and window length for one window kind.
    pub fn window(&self, kind: WindowKind) -> (u32, Duration) {
        match kind {
            WindowKind::Hourly => (self.hourly_limit, HOURLY_WINDOW),
            WindowKind::Burst => (self.burst_limit, self.burst_window),
        }
    }
}

/// Start of the fixed window of length `window` containing `now`.
pub fn fixed_window_start(now: Timestamp, window: Duration) -> Timestamp {
    let len_ms = window.as_millis().max(1) as i64;
    let now_ms = now.timestamp_millis();
    let start_ms = now_ms - now_ms.rem_euclid(len_ms);
    Utc.timestamp_millis_opt(start_ms).single().unwrap_or(now)
}

/// Time left in the fixed window containing `now`.
pub fn fixed_window_retry_after(now: Timestamp, window: Duration) -> Duration {
    let end = fixed_window_start(now, window) + to_chrono(window);
    (end - now).to_std().unwrap_or(Duration::ZERO)
}

/// Time until the oldest entry of a sliding window falls out of it.
pub fn sliding_window_retry_after(
    oldest: Timestamp,
    now: Timestamp,
    window: Duration,
) -> Duration {
    let frees_at = oldest + to_chrono(window);
    (frees_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Counter key for the hourly window: one key per window start.
pub fn hourly_key(user_id: DbId, channel: Channel, window_start: DateTime<Utc>) -> String {
    format!(
        "rl:{user_id}:{channel}:{}:{}",
        WindowKind::Hourly,
        window_start.timestamp()
    )
}

/// Sliding-log key for the burst window.
pub fn burst_key(user_id: DbId, channel: Channel) -> String {
    format!("rl:{user_id}:{channel}:{}", WindowKind::Burst)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn defaults_match_platform_limits() {
        assert_eq!(ChannelPolicy::default_for(Channel::Email).hourly_limit, 10);
        assert_eq!(ChannelPolicy::default_for(Channel::InApp).hourly_limit, 20);
        assert_eq!(ChannelPolicy::default_for(Channel::Sms).hourly_limit, 5);
        assert_eq!(ChannelPolicy::default_for(Channel::Push).hourly_limit, 50);
        let burst = ChannelPolicy::default_for(Channel::Push);
        assert_eq!(burst.burst_limit, 5);
        assert_eq!(burst.burst_window, Duration::from_secs(10));
    }

    #[test]
    fn only_email_falls_back_to_digest() {
        for channel in Channel::ALL {
            assert_eq!(
                ChannelPolicy::default_for(channel).digest_fallback,
                channel == Channel::Email
            );
        }
    }

    #[test]
    fn fixed_window_aligns_to_hour() {
        // 10:15:30 -> 10:00:00
        let now = at(10 * 3600 + 15 * 60 + 30);
        assert_eq!(fixed_window_start(now, HOURLY_WINDOW), at(10 * 3600));
    }

    #[test]
    fn fixed_window_retry_after_counts_to_window_end() {
        let now = at(10 * 3600 + 45 * 60);
        assert_eq!(
            fixed_window_retry_after(now, HOURLY_WINDOW),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn sliding_retry_after_counts_from_oldest_entry() {
        let oldest = at(100);
        let now = at(104);
        assert_eq!(
            sliding_window_retry_after(oldest, now, Duration::from_secs(10)),
            Duration::from_secs(6)
        );
        // Already expired entries never yield a negative wait.
        assert_eq!(
            sliding_window_retry_after(oldest, at(200), Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn keys_embed_user_channel_and_kind() {
        assert_eq!(burst_key(7, Channel::Sms), "rl:7:sms:burst");
        assert_eq!(hourly_key(7, Channel::Email, at(3600)), "rl:7:email:hourly:3600");
    }

    #[test]
    fn decision_serializes_retry_after_in_whole_seconds() {
        let decision = RateLimitDecision::deny(WindowKind::Burst, Duration::from_millis(2500));
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json, serde_json::json!({"allowed": false, "retryAfter": 3}));
    }
}
