//! PostgreSQL-backed [`NotificationStore`] delegating to the repositories.

use async_trait::async_trait;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use pitchey_db::models::digest::{DigestItem, DigestPlacement, DigestWindow};
use pitchey_db::models::notification::{
    AttemptCount, DeliveryAttempt, InsertOutcome, NewDeliveryAttempt, NewNotificationRecord,
    NotificationRecord,
};
use pitchey_db::models::preference::UserPreference;
use pitchey_db::repositories::{
    DeliveryAttemptRepo, DigestRepo, NotificationRepo, PreferenceRepo, SuppressionRepo,
};
use pitchey_db::DbPool;

use super::{NotificationStore, StoreError};

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn find_record(&self, id: DbId) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(NotificationRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_record_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(NotificationRepo::find_by_event_id(&self.pool, event_id).await?)
    }

    async fn insert_record(
        &self,
        record: &NewNotificationRecord,
        attempts: &[NewDeliveryAttempt],
        digests: &[DigestPlacement],
    ) -> Result<InsertOutcome, StoreError> {
        Ok(NotificationRepo::create_with_attempts(&self.pool, record, attempts, digests).await?)
    }

    async fn list_unread_in_app(
        &self,
        user_id: DbId,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(NotificationRepo::list_unread_in_app(&self.pool, user_id, limit).await?)
    }

    async fn unread_in_app_count(&self, user_id: DbId) -> Result<i64, StoreError> {
        Ok(NotificationRepo::unread_in_app_count(&self.pool, user_id).await?)
    }

    async fn find_attempt(&self, id: DbId) -> Result<Option<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_attempt_for_channel(
        &self,
        notification_id: DbId,
        channel: Channel,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::find_for_channel(&self.pool, notification_id, channel).await?)
    }

    async fn list_attempts(
        &self,
        notification_id: DbId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::list_for_notification(&self.pool, notification_id).await?)
    }

    async fn find_attempt_by_provider_ref(
        &self,
        channel: Channel,
        provider_ref: &str,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::find_by_provider_ref(&self.pool, channel, provider_ref).await?)
    }

    async fn compare_and_set_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected: DeliveryStatus,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::compare_and_set(&self.pool, attempt, expected).await?)
    }

    async fn list_due_retries(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::list_due_retries(&self.pool, now, limit).await?)
    }

    async fn list_pending_attempts(
        &self,
        after_id: DbId,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        Ok(DeliveryAttemptRepo::list_pending(&self.pool, after_id, cutoff, limit).await?)
    }

    async fn attempt_counts_since(
        &self,
        since: Timestamp,
    ) -> Result<Vec<AttemptCount>, StoreError> {
        Ok(DeliveryAttemptRepo::count_since(&self.pool, since).await?)
    }

    async fn find_preferences(
        &self,
        user_id: DbId,
    ) -> Result<Option<UserPreference>, StoreError> {
        Ok(PreferenceRepo::find(&self.pool, user_id).await?)
    }

    async fn save_preferences(&self, prefs: &UserPreference) -> Result<UserPreference, StoreError> {
        Ok(PreferenceRepo::upsert(&self.pool, prefs).await?)
    }

    async fn suppress_channel(
        &self,
        user_id: DbId,
        channel: Channel,
        reason: &str,
    ) -> Result<(), StoreError> {
        Ok(SuppressionRepo::suppress(&self.pool, user_id, channel, reason).await?)
    }

    async fn suppressed_channels(&self, user_id: DbId) -> Result<Vec<Channel>, StoreError> {
        let rows = SuppressionRepo::list_for_user(&self.pool, user_id).await?;
        Ok(rows.into_iter().map(|s| s.channel).collect())
    }

    async fn open_digest_window(
        &self,
        user_id: DbId,
        window_key: &str,
        flush_at: Timestamp,
    ) -> Result<DigestWindow, StoreError> {
        Ok(DigestRepo::open_window(&self.pool, user_id, window_key, flush_at).await?)
    }

    async fn add_digest_item(
        &self,
        window_id: DbId,
        notification_id: DbId,
        event_type: EventType,
    ) -> Result<(), StoreError> {
        Ok(DigestRepo::add_item(&self.pool, window_id, notification_id, event_type).await?)
    }

    async fn list_due_digest_windows(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DigestWindow>, StoreError> {
        Ok(DigestRepo::list_due(&self.pool, now, limit).await?)
    }

    async fn list_digest_items(&self, window_id: DbId) -> Result<Vec<DigestItem>, StoreError> {
        Ok(DigestRepo::list_items(&self.pool, window_id).await?)
    }

    async fn reschedule_digest_window(
        &self,
        window_id: DbId,
        flush_at: Timestamp,
    ) -> Result<bool, StoreError> {
        Ok(DigestRepo::reschedule(&self.pool, window_id, flush_at).await?)
    }

    async fn archive_digest_window(&self, window_id: DbId) -> Result<bool, StoreError> {
        Ok(DigestRepo::archive(&self.pool, window_id).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(pitchey_db::health_check(&self.pool).await?)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
