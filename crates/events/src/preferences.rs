//! Preference resolution: which channels a notification goes to, and how.
//!
//! [`PreferenceResolver`] loads a user's stored preferences and channel
//! suppressions through a [`PreferenceSource`], caches them for a short TTL
//! and applies the routing rules:
//!
//! - no stored row: platform defaults (in-app and email, instant);
//! - source unavailable: the last loaded preferences however old, else
//!   in-app only plus email for security events;
//! - security events always reach in-app and email, instantly;
//! - opted-out event types reach no channel;
//! - email follows the digest frequency (`never` drops it);
//! - do-not-disturb silences SMS and push;
//! - suppressed channels are removed (in-app never is).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use pitchey_core::channels::Channel;
use pitchey_core::digest::{parse_timezone, window_for, DigestFrequency, WindowSlot};
use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use pitchey_db::models::preference::UserPreference;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::store::NotificationStore;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error("Preference service unavailable: {0}")]
    Unavailable(String),
}

/// Where preferences and suppressions are read from.
#[async_trait]
pub trait PreferenceSource: Send + Sync {
    async fn load(&self, user_id: DbId) -> Result<Option<UserPreference>, PreferenceError>;

    async fn suppressed(&self, user_id: DbId) -> Result<Vec<Channel>, PreferenceError>;
}

/// Reads preferences from the notification store.
pub struct StorePreferenceSource {
    store: Arc<dyn NotificationStore>,
}

impl StorePreferenceSource {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PreferenceSource for StorePreferenceSource {
    async fn load(&self, user_id: DbId) -> Result<Option<UserPreference>, PreferenceError> {
        self.store
            .find_preferences(user_id)
            .await
            .map_err(|e| PreferenceError::Unavailable(e.to_string()))
    }

    async fn suppressed(&self, user_id: DbId) -> Result<Vec<Channel>, PreferenceError> {
        self.store
            .suppressed_channels(user_id)
            .await
            .map_err(|e| PreferenceError::Unavailable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// How a resolved channel is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Instant,
    /// Batched into the user's digest window of this frequency.
    Digest(DigestFrequency),
}

/// One effective channel for a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub channel: Channel,
    pub mode: DeliveryMode,
    /// Contact point to deliver to; `None` for in-app.
    pub recipient: Option<String>,
}

/// The user's digest settings, used to place items in windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestSchedule {
    pub frequency: DigestFrequency,
    pub digest_time: NaiveTime,
    pub offset: FixedOffset,
}

impl DigestSchedule {
    fn from_preferences(prefs: &UserPreference) -> Self {
        let offset = parse_timezone(&prefs.timezone).unwrap_or_else(|e| {
            tracing::warn!(user_id = prefs.user_id, error = %e, "Invalid stored timezone, using UTC");
            Utc.fix()
        });
        Self {
            frequency: prefs.digest_frequency,
            digest_time: prefs.digest_time,
            offset,
        }
    }

    /// The window an item deferred at `now` with `frequency` belongs to.
    pub fn slot(&self, frequency: DigestFrequency, now: Timestamp) -> Option<WindowSlot> {
        window_for(frequency, self.digest_time, self.offset, now)
    }

    /// Frequency used when a rate-limited email falls back to the digest:
    /// the user's own cadence when batched, daily otherwise.
    pub fn fallback_frequency(&self) -> DigestFrequency {
        if self.frequency.is_batched() {
            self.frequency
        } else {
            DigestFrequency::Daily
        }
    }
}

/// Output of [`PreferenceResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub routes: Vec<ResolvedRoute>,
    /// Preferences could not be read and safe defaults were used.
    pub degraded: bool,
    pub schedule: DigestSchedule,
}

impl Resolution {
    pub fn channels(&self) -> Vec<Channel> {
        self.routes.iter().map(|r| r.channel).collect()
    }

    pub fn instant_count(&self) -> usize {
        self.routes
            .iter()
            .filter(|r| r.mode == DeliveryMode::Instant)
            .count()
    }
}

/// Apply the routing rules to loaded preferences.
pub fn resolve_routes(
    prefs: &UserPreference,
    suppressed: &[Channel],
    event_type: EventType,
    now: Timestamp,
) -> Vec<ResolvedRoute> {
    let security = event_type.is_security_relevant();
    let dnd_active = prefs.dnd_until.is_some_and(|until| until > now);

    if !security && prefs.is_opted_out(event_type) {
        return Vec::new();
    }

    let mut routes = Vec::new();
    for channel in Channel::ALL {
        let forced = security && matches!(channel, Channel::InApp | Channel::Email);
        if !prefs.channel_enabled(channel) && !forced {
            continue;
        }
        if !security && dnd_active && channel.is_interruptive() {
            continue;
        }
        if channel != Channel::InApp && suppressed.contains(&channel) {
            continue;
        }

        let mode = if channel == Channel::Email && !security {
            match prefs.digest_frequency {
                DigestFrequency::Instant => DeliveryMode::Instant,
                DigestFrequency::Never => continue,
                batched => DeliveryMode::Digest(batched),
            }
        } else {
            DeliveryMode::Instant
        };

        routes.push(ResolvedRoute {
            channel,
            mode,
            recipient: prefs.recipient_for(channel).map(str::to_string),
        });
    }
    routes
}

/// Safe defaults used while the preference source is unavailable.
fn degraded_routes(event_type: EventType) -> Vec<ResolvedRoute> {
    let mut routes = vec![ResolvedRoute {
        channel: Channel::InApp,
        mode: DeliveryMode::Instant,
        recipient: None,
    }];
    if event_type.is_security_relevant() {
        routes.push(ResolvedRoute {
            channel: Channel::Email,
            mode: DeliveryMode::Instant,
            recipient: None,
        });
    }
    routes
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct CacheEntry {
    prefs: UserPreference,
    suppressed: Vec<Channel>,
    loaded_at: Instant,
}

/// Cached, fail-open preference lookups.
pub struct PreferenceResolver {
    source: Arc<dyn PreferenceSource>,
    cache: RwLock<HashMap<DbId, CacheEntry>>,
    ttl: Duration,
    timeout: Duration,
}

impl PreferenceResolver {
    pub fn new(source: Arc<dyn PreferenceSource>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
            ttl,
            timeout,
        }
    }

    /// Effective channels for one notification to `user_id`.
    pub async fn resolve(&self, user_id: DbId, event_type: EventType) -> Resolution {
        let now = Utc::now();
        let error = match self.load(user_id).await {
            Ok(entry) => {
                return Resolution {
                    routes: resolve_routes(&entry.prefs, &entry.suppressed, event_type, now),
                    degraded: false,
                    schedule: DigestSchedule::from_preferences(&entry.prefs),
                }
            }
            Err(e) => e,
        };

        if let Some(entry) = self.stale(user_id).await {
            tracing::warn!(
                user_id,
                %event_type,
                error = %error,
                age_secs = entry.loaded_at.elapsed().as_secs(),
                "Using last known preferences"
            );
            return Resolution {
                routes: resolve_routes(&entry.prefs, &entry.suppressed, event_type, now),
                degraded: true,
                schedule: DigestSchedule::from_preferences(&entry.prefs),
            };
        }

        tracing::warn!(user_id, %event_type, error = %error, "Using default notification channels");
        Resolution {
            routes: degraded_routes(event_type),
            degraded: true,
            schedule: DigestSchedule::from_preferences(&UserPreference::defaults(user_id)),
        }
    }

    /// The user's contact point for `channel`, read at send time for
    /// attempts stored without one.
    pub async fn contact(
        &self,
        user_id: DbId,
        channel: Channel,
    ) -> Result<Option<String>, PreferenceError> {
        let entry = match self.load(user_id).await {
            Ok(entry) => entry,
            Err(e) => self.stale(user_id).await.ok_or(e)?,
        };
        Ok(entry.prefs.recipient_for(channel).map(str::to_string))
    }

    /// Drop the cached entry so the next lookup reads fresh preferences.
    pub async fn invalidate(&self, user_id: DbId) {
        self.cache.write().await.remove(&user_id);
    }

    /// The cached entry regardless of age.
    async fn stale(&self, user_id: DbId) -> Option<CacheEntry> {
        self.cache.read().await.get(&user_id).cloned()
    }

    async fn load(&self, user_id: DbId) -> Result<CacheEntry, PreferenceError> {
        if let Some(entry) = self.cache.read().await.get(&user_id) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(entry.clone());
            }
        }

        let fetch = async {
            let prefs = self.source.load(user_id).await?;
            let suppressed = self.source.suppressed(user_id).await?;
            Ok::<_, PreferenceError>((prefs, suppressed))
        };
        let (prefs, suppressed) = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| PreferenceError::Unavailable("preference lookup timed out".into()))??;

        let entry = CacheEntry {
            prefs: prefs.unwrap_or_else(|| UserPreference::defaults(user_id)),
            suppressed,
            loaded_at: Instant::now(),
        };
        self.cache.write().await.insert(user_id, entry.clone());
        Ok(entry)
    }
}
