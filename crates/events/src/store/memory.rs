//! In-process [`NotificationStore`] for single-node development and tests.
//!
//! All state lives behind one `RwLock`; every operation holds the lock for
//! its whole read-modify-write so the uniqueness and compare-and-set rules
//! match the PostgreSQL backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use pitchey_db::models::digest::{DigestItem, DigestPlacement, DigestWindow};
use pitchey_db::models::notification::{
    AttemptCount, DeliveryAttempt, InsertOutcome, NewDeliveryAttempt, NewNotificationRecord,
    NotificationRecord,
};
use pitchey_db::models::preference::{ChannelSuppression, UserPreference};
use tokio::sync::RwLock;

use super::{NotificationStore, StoreError};

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    records: BTreeMap<DbId, NotificationRecord>,
    records_by_event: HashMap<String, DbId>,
    attempts: BTreeMap<DbId, DeliveryAttempt>,
    preferences: HashMap<DbId, UserPreference>,
    suppressions: BTreeMap<(DbId, Channel), ChannelSuppression>,
    windows: BTreeMap<DbId, DigestWindow>,
    items: Vec<StoredItem>,
}

struct StoredItem {
    id: DbId,
    window_id: DbId,
    notification_id: DbId,
    event_type: EventType,
    position: i32,
}

impl MemoryState {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn open_window(&mut self, user_id: DbId, window_key: &str, flush_at: Timestamp) -> DigestWindow {
        if let Some(open) = self.windows.values().find(|w| {
            w.user_id == user_id && w.window_key == window_key && w.archived_at.is_none()
        }) {
            return open.clone();
        }
        let window = DigestWindow {
            id: self.next_id(),
            user_id,
            window_key: window_key.to_string(),
            flush_at,
            archived_at: None,
            created_at: Utc::now(),
        };
        self.windows.insert(window.id, window.clone());
        window
    }

    fn add_item(&mut self, window_id: DbId, notification_id: DbId, event_type: EventType) {
        let mut last_position = 0;
        for item in self.items.iter().filter(|i| i.window_id == window_id) {
            if item.notification_id == notification_id {
                return;
            }
            last_position = last_position.max(item.position);
        }
        let id = self.next_id();
        self.items.push(StoredItem {
            id,
            window_id,
            notification_id,
            event_type,
            position: last_position + 1,
        });
    }

    fn is_unread_in_app(&self, record_id: DbId) -> bool {
        self.attempts.values().any(|a| {
            a.notification_id == record_id
                && a.channel == Channel::InApp
                && matches!(a.status, DeliveryStatus::Pending | DeliveryStatus::Sent)
        })
    }
}

/// Volatile store; contents are lost on restart.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    digests_available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            available: AtomicBool::new(true),
            digests_available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails with
    /// [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a digest table outage: digest writes fail, and so does any
    /// record insert that carries digest items, storing nothing.
    pub fn set_digests_available(&self, available: bool) {
        self.digests_available.store(available, Ordering::SeqCst);
    }

    /// Every attempt of a user, oldest first.
    pub async fn attempts_for_user(&self, user_id: DbId) -> Vec<DeliveryAttempt> {
        let state = self.state.read().await;
        state
            .attempts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Every record of a user, oldest first.
    pub async fn records_for_user(&self, user_id: DbId) -> Vec<NotificationRecord> {
        let state = self.state.read().await;
        state
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Every digest window of a user, archived or not.
    pub async fn windows_for_user(&self, user_id: DbId) -> Vec<DigestWindow> {
        let state = self.state.read().await;
        state
            .windows
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".into()))
        }
    }

    fn check_digests(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.digests_available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("digest tables disabled".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn find_record(&self, id: DbId) -> Result<Option<NotificationRecord>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn find_record_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .records_by_event
            .get(event_id)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn insert_record(
        &self,
        input: &NewNotificationRecord,
        attempts: &[NewDeliveryAttempt],
        digests: &[DigestPlacement],
    ) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .records_by_event
            .get(&input.event_id)
            .and_then(|id| state.records.get(id))
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }
        if !digests.is_empty() {
            self.check_digests()?;
        }

        let now = Utc::now();
        let record = NotificationRecord {
            id: state.next_id(),
            event_id: input.event_id.clone(),
            user_id: input.user_id,
            event_type: input.event_type,
            channels: input.channels.clone(),
            variant: input.variant.clone(),
            rendered_title: input.rendered_title.clone(),
            rendered_body: input.rendered_body.clone(),
            payload: input.payload.clone(),
            created_at: now,
        };

        let mut created = Vec::with_capacity(attempts.len());
        for new in attempts {
            let attempt = DeliveryAttempt {
                id: state.next_id(),
                notification_id: record.id,
                user_id: record.user_id,
                channel: new.channel,
                recipient: new.recipient.clone(),
                status: new.status,
                attempt_count: 0,
                last_attempt_at: None,
                next_retry_at: None,
                error_reason: new.error_reason.clone(),
                provider_ref: None,
                retry_after_secs: new.retry_after_secs,
                sent_at: None,
                delivered_at: None,
                failed_at: None,
                created_at: now,
                updated_at: now,
            };
            state.attempts.insert(attempt.id, attempt.clone());
            created.push(attempt);
        }

        for placement in digests {
            let window = state.open_window(record.user_id, &placement.window_key, placement.flush_at);
            state.add_item(window.id, record.id, record.event_type);
        }

        state
            .records_by_event
            .insert(record.event_id.clone(), record.id);
        state.records.insert(record.id, record.clone());

        Ok(InsertOutcome::Created {
            record,
            attempts: created,
        })
    }

    async fn list_unread_in_app(
        &self,
        user_id: DbId,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut unread: Vec<NotificationRecord> = state
            .records
            .values()
            .filter(|r| r.user_id == user_id && state.is_unread_in_app(r.id))
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        unread.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(unread)
    }

    async fn unread_in_app_count(&self, user_id: DbId) -> Result<i64, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let count = state
            .attempts
            .values()
            .filter(|a| {
                a.user_id == user_id
                    && a.channel == Channel::InApp
                    && matches!(a.status, DeliveryStatus::Pending | DeliveryStatus::Sent)
            })
            .count();
        Ok(count as i64)
    }

    async fn find_attempt(&self, id: DbId) -> Result<Option<DeliveryAttempt>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.attempts.get(&id).cloned())
    }

    async fn find_attempt_for_channel(
        &self,
        notification_id: DbId,
        channel: Channel,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .attempts
            .values()
            .find(|a| a.notification_id == notification_id && a.channel == channel)
            .cloned())
    }

    async fn list_attempts(
        &self,
        notification_id: DbId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .attempts
            .values()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn find_attempt_by_provider_ref(
        &self,
        channel: Channel,
        provider_ref: &str,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .attempts
            .values()
            .rev()
            .find(|a| a.channel == channel && a.provider_ref.as_deref() == Some(provider_ref))
            .cloned())
    }

    async fn compare_and_set_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected: DeliveryStatus,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        let Some(stored) = state.attempts.get_mut(&attempt.id) else {
            return Ok(None);
        };
        if stored.status != expected {
            return Ok(None);
        }
        stored.status = attempt.status;
        stored.attempt_count = attempt.attempt_count;
        stored.last_attempt_at = attempt.last_attempt_at;
        stored.next_retry_at = attempt.next_retry_at;
        stored.error_reason = attempt.error_reason.clone();
        stored.provider_ref = attempt.provider_ref.clone();
        stored.sent_at = attempt.sent_at;
        stored.delivered_at = attempt.delivered_at;
        stored.failed_at = attempt.failed_at;
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn list_due_retries(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut due: Vec<DeliveryAttempt> = state
            .attempts
            .values()
            .filter(|a| {
                a.status == DeliveryStatus::Failed && a.next_retry_at.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|a| a.next_retry_at);
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn list_pending_attempts(
        &self,
        after_id: DbId,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .attempts
            .range(after_id + 1..)
            .map(|(_, a)| a)
            .filter(|a| a.status == DeliveryStatus::Pending && a.updated_at <= cutoff)
            .take(usize::try_from(limit.max(0)).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn attempt_counts_since(
        &self,
        since: Timestamp,
    ) -> Result<Vec<AttemptCount>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut counts: BTreeMap<(Channel, i16), i64> = BTreeMap::new();
        for attempt in state.attempts.values().filter(|a| a.created_at >= since) {
            *counts
                .entry((attempt.channel, attempt.status.id()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter_map(|((channel, status_id), count)| {
                DeliveryStatus::from_id(status_id).map(|status| AttemptCount {
                    channel,
                    status,
                    count,
                })
            })
            .collect())
    }

    async fn find_preferences(
        &self,
        user_id: DbId,
    ) -> Result<Option<UserPreference>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.preferences.get(&user_id).cloned())
    }

    async fn save_preferences(&self, prefs: &UserPreference) -> Result<UserPreference, StoreError> {
        self.check()?;
        let mut saved = prefs.clone();
        saved.updated_at = Utc::now();
        self.state
            .write()
            .await
            .preferences
            .insert(saved.user_id, saved.clone());
        Ok(saved)
    }

    async fn suppress_channel(
        &self,
        user_id: DbId,
        channel: Channel,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .suppressions
            .entry((user_id, channel))
            .or_insert_with(|| ChannelSuppression {
                user_id,
                channel,
                reason: reason.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn suppressed_channels(&self, user_id: DbId) -> Result<Vec<Channel>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .suppressions
            .keys()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, channel)| *channel)
            .collect())
    }

    async fn open_digest_window(
        &self,
        user_id: DbId,
        window_key: &str,
        flush_at: Timestamp,
    ) -> Result<DigestWindow, StoreError> {
        self.check_digests()?;
        Ok(self.state.write().await.open_window(user_id, window_key, flush_at))
    }

    async fn add_digest_item(
        &self,
        window_id: DbId,
        notification_id: DbId,
        event_type: EventType,
    ) -> Result<(), StoreError> {
        self.check_digests()?;
        self.state
            .write()
            .await
            .add_item(window_id, notification_id, event_type);
        Ok(())
    }

    async fn list_due_digest_windows(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DigestWindow>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut due: Vec<DigestWindow> = state
            .windows
            .values()
            .filter(|w| w.archived_at.is_none() && w.flush_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.flush_at.cmp(&b.flush_at).then(a.id.cmp(&b.id)));
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn list_digest_items(&self, window_id: DbId) -> Result<Vec<DigestItem>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut items: Vec<DigestItem> = state
            .items
            .iter()
            .filter(|i| i.window_id == window_id)
            .map(|i| DigestItem {
                id: i.id,
                window_id: i.window_id,
                notification_id: i.notification_id,
                event_type: i.event_type,
                position: i.position,
                title: state
                    .records
                    .get(&i.notification_id)
                    .map(|r| r.rendered_title.clone())
                    .unwrap_or_default(),
            })
            .collect();
        items.sort_by(|a, b| a.position.cmp(&b.position).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn reschedule_digest_window(
        &self,
        window_id: DbId,
        flush_at: Timestamp,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.windows.get_mut(&window_id) {
            Some(window) if window.archived_at.is_none() => {
                window.flush_at = flush_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archive_digest_window(&self, window_id: DbId) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.windows.get_mut(&window_id) {
            Some(window) if window.archived_at.is_none() => {
                window.archived_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
