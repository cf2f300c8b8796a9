//! Engine configuration loaded once at startup.

use std::collections::HashMap;
use std::time::Duration;

use pitchey_core::channels::Channel;
use pitchey_core::experiment::Experiment;
use pitchey_core::rate_limit::ChannelPolicy;
use pitchey_core::retry::RetryPolicy;

use crate::queue::MIN_CAPACITY;

/// Typed per-channel policies. Channels without an entry use
/// [`ChannelPolicy::default_for`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPolicies {
    policies: HashMap<Channel, ChannelPolicy>,
}

impl ChannelPolicies {
    pub fn new() -> Self {
        Self {
            policies: Channel::ALL
                .into_iter()
                .map(|c| (c, ChannelPolicy::default_for(c)))
                .collect(),
        }
    }

    /// Replace the policy of one channel.
    pub fn with(mut self, channel: Channel, policy: ChannelPolicy) -> Self {
        self.policies.insert(channel, policy);
        self
    }

    pub fn get(&self, channel: Channel) -> ChannelPolicy {
        self.policies
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| ChannelPolicy::default_for(channel))
    }

    /// Load per-channel overrides from the environment on top of the
    /// platform defaults.
    ///
    /// | Env Var                          | Default            |
    /// |----------------------------------|--------------------|
    /// | `NOTIFY_<CHANNEL>_ENABLED`       | `true`             |
    /// | `NOTIFY_<CHANNEL>_HOURLY_LIMIT`  | per-channel        |
    /// | `NOTIFY_<CHANNEL>_BURST_LIMIT`   | `5`                |
    /// | `NOTIFY_<CHANNEL>_DIGEST_FALLBACK` | `true` for email |
    /// | `NOTIFY_BURST_WINDOW_SECS`       | `10`               |
    ///
    /// `<CHANNEL>` is one of `IN_APP`, `EMAIL`, `SMS`, `PUSH`, `WEBHOOK`.
    pub fn from_env() -> Self {
        let burst_window = env_parse::<u64>("NOTIFY_BURST_WINDOW_SECS").map(Duration::from_secs);
        let mut policies = HashMap::new();
        for channel in Channel::ALL {
            let mut policy = ChannelPolicy::default_for(channel);
            let prefix = format!("NOTIFY_{}", channel.env_key());
            if let Some(enabled) = env_parse::<bool>(&format!("{prefix}_ENABLED")) {
                policy.enabled = enabled;
            }
            if let Some(limit) = env_parse::<u32>(&format!("{prefix}_HOURLY_LIMIT")) {
                policy.hourly_limit = limit;
            }
            if let Some(limit) = env_parse::<u32>(&format!("{prefix}_BURST_LIMIT")) {
                policy.burst_limit = limit;
            }
            if let Some(fallback) = env_parse::<bool>(&format!("{prefix}_DIGEST_FALLBACK")) {
                policy.digest_fallback = fallback;
            }
            if let Some(window) = burst_window {
                policy.burst_window = window;
            }
            policies.insert(channel, policy);
        }
        Self { policies }
    }
}

impl Default for ChannelPolicies {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of the dispatcher, workers and background services.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policies: ChannelPolicies,
    pub retry: RetryPolicy,
    /// Number of send workers draining the queue.
    pub worker_count: usize,
    /// Capacity of the bounded send queue.
    pub queue_capacity: usize,
    /// How long `notify` waits for queue capacity before failing with
    /// `QueueFull`.
    pub enqueue_timeout: Duration,
    pub rate_limit_timeout: Duration,
    pub preference_timeout: Duration,
    pub preference_cache_ttl: Duration,
    pub send_timeout: Duration,
    /// Cadence of the digest flush loop.
    pub digest_interval: Duration,
    /// Cadence of the retry loop.
    pub retry_interval: Duration,
    /// Age after which a `pending` attempt is assumed lost and re-enqueued.
    pub pending_sweep_after: Duration,
    /// Cadence of the in-process rate limit reaper.
    pub reaper_interval: Duration,
    /// Maximum rows processed per background tick.
    pub batch_size: i64,
    pub experiments: Vec<Experiment>,
    pub sms_gateway_url: Option<String>,
    pub push_gateway_url: Option<String>,
    pub webhook_signing_secret: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policies: ChannelPolicies::new(),
            retry: RetryPolicy::default(),
            worker_count: 8,
            queue_capacity: 1024,
            enqueue_timeout: Duration::from_secs(2),
            rate_limit_timeout: Duration::from_secs(2),
            preference_timeout: Duration::from_secs(2),
            preference_cache_ttl: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
            digest_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(15),
            pending_sweep_after: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
            batch_size: 500,
            experiments: Vec::new(),
            sms_gateway_url: None,
            push_gateway_url: None,
            webhook_signing_secret: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `NOTIFY_WORKERS`                 | `8`     |
    /// | `NOTIFY_QUEUE_CAPACITY`          | `1024`  |
    /// | `NOTIFY_ENQUEUE_TIMEOUT_MS`      | `2000`  |
    /// | `NOTIFY_RATE_LIMIT_TIMEOUT_MS`   | `2000`  |
    /// | `NOTIFY_PREFERENCE_TIMEOUT_MS`   | `2000`  |
    /// | `NOTIFY_PREFERENCE_CACHE_SECS`   | `60`    |
    /// | `NOTIFY_SEND_TIMEOUT_SECS`       | `10`    |
    /// | `NOTIFY_DIGEST_INTERVAL_SECS`    | `60`    |
    /// | `NOTIFY_RETRY_INTERVAL_SECS`     | `15`    |
    /// | `NOTIFY_PENDING_SWEEP_SECS`      | `300`   |
    /// | `NOTIFY_REAPER_INTERVAL_SECS`    | `60`    |
    /// | `NOTIFY_BATCH_SIZE`              | `500`   |
    /// | `NOTIFY_RETRY_BASE_SECS`         | `30`    |
    /// | `NOTIFY_RETRY_MULTIPLIER`        | `2.0`   |
    /// | `NOTIFY_RETRY_MAX_DELAY_SECS`    | `3600`  |
    /// | `NOTIFY_RETRY_MAX_ATTEMPTS`      | `5`     |
    /// | `NOTIFY_EXPERIMENTS`             | `[]` (JSON array) |
    /// | `SMS_GATEWAY_URL`                | unset (SMS disabled) |
    /// | `PUSH_GATEWAY_URL`               | unset (push disabled) |
    /// | `WEBHOOK_SIGNING_SECRET`         | unset (unsigned) |
    ///
    /// Per-channel limits are described on [`ChannelPolicies::from_env`].
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = RetryPolicy::default();

        let retry = RetryPolicy {
            base_delay: env_parse("NOTIFY_RETRY_BASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.base_delay),
            multiplier: env_parse("NOTIFY_RETRY_MULTIPLIER").unwrap_or(retry_defaults.multiplier),
            max_delay: env_parse("NOTIFY_RETRY_MAX_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.max_delay),
            max_attempts: env_parse("NOTIFY_RETRY_MAX_ATTEMPTS")
                .unwrap_or(retry_defaults.max_attempts),
        };

        let experiments = match std::env::var("NOTIFY_EXPERIMENTS") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).expect("NOTIFY_EXPERIMENTS must be a JSON array of experiments")
            }
            _ => Vec::new(),
        };

        let queue_capacity: usize = env_parse("NOTIFY_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity);
        assert!(
            queue_capacity >= MIN_CAPACITY,
            "NOTIFY_QUEUE_CAPACITY must be at least {MIN_CAPACITY}"
        );

        Self {
            policies: ChannelPolicies::from_env(),
            retry,
            worker_count: env_parse("NOTIFY_WORKERS").unwrap_or(defaults.worker_count).max(1),
            queue_capacity,
            enqueue_timeout: env_millis("NOTIFY_ENQUEUE_TIMEOUT_MS").unwrap_or(defaults.enqueue_timeout),
            rate_limit_timeout: env_millis("NOTIFY_RATE_LIMIT_TIMEOUT_MS")
                .unwrap_or(defaults.rate_limit_timeout),
            preference_timeout: env_millis("NOTIFY_PREFERENCE_TIMEOUT_MS")
                .unwrap_or(defaults.preference_timeout),
            preference_cache_ttl: env_secs("NOTIFY_PREFERENCE_CACHE_SECS")
                .unwrap_or(defaults.preference_cache_ttl),
            send_timeout: env_secs("NOTIFY_SEND_TIMEOUT_SECS").unwrap_or(defaults.send_timeout),
            digest_interval: env_secs("NOTIFY_DIGEST_INTERVAL_SECS").unwrap_or(defaults.digest_interval),
            retry_interval: env_secs("NOTIFY_RETRY_INTERVAL_SECS").unwrap_or(defaults.retry_interval),
            pending_sweep_after: env_secs("NOTIFY_PENDING_SWEEP_SECS")
                .unwrap_or(defaults.pending_sweep_after),
            reaper_interval: env_secs("NOTIFY_REAPER_INTERVAL_SECS").unwrap_or(defaults.reaper_interval),
            batch_size: env_parse("NOTIFY_BATCH_SIZE").unwrap_or(defaults.batch_size),
            experiments,
            sms_gateway_url: non_empty_env("SMS_GATEWAY_URL"),
            push_gateway_url: non_empty_env("PUSH_GATEWAY_URL"),
            webhook_signing_secret: non_empty_env("WEBHOOK_SIGNING_SECRET"),
        }
    }
}

/// Parse an optional environment variable, panicking on malformed values so
/// misconfiguration fails at startup.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => panic!("{key} has an invalid value: {raw}"),
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
