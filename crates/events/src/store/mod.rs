//! Storage abstraction for records, attempts, preferences and digests.
//!
//! [`PgStore`](postgres::PgStore) is the production backend; the
//! [`MemoryStore`](memory::MemoryStore) keeps everything in process for
//! development and tests. Both enforce the same constraints: unique
//! `event_id`, compare-and-set attempt updates and one open digest window
//! per `(user, window_key)`.

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

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Persistence failure. Always retryable from the producer's point of view.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Everything the engine reads and writes.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    // -- records --

    async fn find_record(&self, id: DbId) -> Result<Option<NotificationRecord>, StoreError>;

    async fn find_record_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>, StoreError>;

    /// Insert a record, its attempts and its digest items atomically, or
    /// return the record already holding `event_id`.
    async fn insert_record(
        &self,
        record: &NewNotificationRecord,
        attempts: &[NewDeliveryAttempt],
        digests: &[DigestPlacement],
    ) -> Result<InsertOutcome, StoreError>;

    async fn list_unread_in_app(
        &self,
        user_id: DbId,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StoreError>;

    async fn unread_in_app_count(&self, user_id: DbId) -> Result<i64, StoreError>;

    // -- attempts --

    async fn find_attempt(&self, id: DbId) -> Result<Option<DeliveryAttempt>, StoreError>;

    async fn find_attempt_for_channel(
        &self,
        notification_id: DbId,
        channel: Channel,
    ) -> Result<Option<DeliveryAttempt>, StoreError>;

    async fn list_attempts(&self, notification_id: DbId)
        -> Result<Vec<DeliveryAttempt>, StoreError>;

    async fn find_attempt_by_provider_ref(
        &self,
        channel: Channel,
        provider_ref: &str,
    ) -> Result<Option<DeliveryAttempt>, StoreError>;

    /// Persist `attempt` only if the stored status still equals `expected`.
    async fn compare_and_set_attempt(
        &self,
        attempt: &DeliveryAttempt,
        expected: DeliveryStatus,
    ) -> Result<Option<DeliveryAttempt>, StoreError>;

    async fn list_due_retries(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Pending attempts with an id above `after_id` last updated at or before
    /// `cutoff`, in id order.
    async fn list_pending_attempts(
        &self,
        after_id: DbId,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, StoreError>;

    async fn attempt_counts_since(&self, since: Timestamp)
        -> Result<Vec<AttemptCount>, StoreError>;

    // -- preferences and suppressions --

    async fn find_preferences(&self, user_id: DbId)
        -> Result<Option<UserPreference>, StoreError>;

    async fn save_preferences(&self, prefs: &UserPreference) -> Result<UserPreference, StoreError>;

    async fn suppress_channel(
        &self,
        user_id: DbId,
        channel: Channel,
        reason: &str,
    ) -> Result<(), StoreError>;

    async fn suppressed_channels(&self, user_id: DbId) -> Result<Vec<Channel>, StoreError>;

    // -- digests --

    async fn open_digest_window(
        &self,
        user_id: DbId,
        window_key: &str,
        flush_at: Timestamp,
    ) -> Result<DigestWindow, StoreError>;

    async fn add_digest_item(
        &self,
        window_id: DbId,
        notification_id: DbId,
        event_type: EventType,
    ) -> Result<(), StoreError>;

    async fn list_due_digest_windows(
        &self,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DigestWindow>, StoreError>;

    async fn list_digest_items(&self, window_id: DbId) -> Result<Vec<DigestItem>, StoreError>;

    async fn reschedule_digest_window(
        &self,
        window_id: DbId,
        flush_at: Timestamp,
    ) -> Result<bool, StoreError>;

    async fn archive_digest_window(&self, window_id: DbId) -> Result<bool, StoreError>;

    // -- health --

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Short backend name reported by the health endpoint.
    fn backend(&self) -> &'static str;
}
