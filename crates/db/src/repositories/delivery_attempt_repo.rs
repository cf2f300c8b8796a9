//! Repository for the `delivery_attempts` table.
//!
//! Status changes are written with compare-and-set on `status_id` so two
//! concurrent transitions of the same attempt cannot both succeed.

use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::notification::{AttemptCount, DeliveryAttempt};

/// Column list for `delivery_attempts` queries.
pub(crate) const COLUMNS: &str = "id, notification_id, user_id, channel, recipient, status_id, \
    attempt_count, last_attempt_at, next_retry_at, error_reason, provider_ref, retry_after_secs, \
    sent_at, delivered_at, failed_at, created_at, updated_at";

/// Provides lookups and compare-and-set updates for delivery attempts.
pub struct DeliveryAttemptRepo;

impl DeliveryAttemptRepo {
    /// Find an attempt by its internal ID.
    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<DeliveryAttempt>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM delivery_attempts WHERE id = $1");
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find the attempt of a notification on one channel.
    pub async fn find_for_channel(
        pool: &PgPool,
        notification_id: DbId,
        channel: Channel,
    ) -> Result<Option<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_attempts \
             WHERE notification_id = $1 AND channel = $2"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(notification_id)
            .bind(channel.as_str())
            .fetch_optional(pool)
            .await
    }

    /// List every attempt of a notification.
    pub async fn list_for_notification(
        pool: &PgPool,
        notification_id: DbId,
    ) -> Result<Vec<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_attempts \
             WHERE notification_id = $1 \
             ORDER BY id"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(notification_id)
            .fetch_all(pool)
            .await
    }

    /// Find the attempt a provider callback refers to.
    pub async fn find_by_provider_ref(
        pool: &PgPool,
        channel: Channel,
        provider_ref: &str,
    ) -> Result<Option<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_attempts \
             WHERE channel = $1 AND provider_ref = $2 \
             ORDER BY id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(channel.as_str())
            .bind(provider_ref)
            .fetch_optional(pool)
            .await
    }

    /// Write every mutable field of `attempt` if the stored status still
    /// equals `expected`.
    ///
    /// Returns `None` when the status changed underneath the caller.
    pub async fn compare_and_set(
        pool: &PgPool,
        attempt: &DeliveryAttempt,
        expected: DeliveryStatus,
    ) -> Result<Option<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "UPDATE delivery_attempts SET \
                status_id = $3, \
                attempt_count = $4, \
                last_attempt_at = $5, \
                next_retry_at = $6, \
                error_reason = $7, \
                provider_ref = $8, \
                sent_at = $9, \
                delivered_at = $10, \
                failed_at = $11, \
                updated_at = NOW() \
             WHERE id = $1 AND status_id = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(attempt.id)
            .bind(expected.id())
            .bind(attempt.status.id())
            .bind(attempt.attempt_count)
            .bind(attempt.last_attempt_at)
            .bind(attempt.next_retry_at)
            .bind(&attempt.error_reason)
            .bind(&attempt.provider_ref)
            .bind(attempt.sent_at)
            .bind(attempt.delivered_at)
            .bind(attempt.failed_at)
            .fetch_optional(pool)
            .await
    }

    /// Failed attempts whose scheduled retry is due, oldest first.
    pub async fn list_due_retries(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_attempts \
             WHERE status_id = $1 AND next_retry_at IS NOT NULL AND next_retry_at <= $2 \
             ORDER BY next_retry_at \
             LIMIT $3"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(DeliveryStatus::Failed.id())
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Pending attempts with `id > after_id` last updated at or before
    /// `cutoff`, in id order, for keyset paging.
    pub async fn list_pending(
        pool: &PgPool,
        after_id: DbId,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<Vec<DeliveryAttempt>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_attempts \
             WHERE status_id = $1 AND id > $2 AND updated_at <= $3 \
             ORDER BY id \
             LIMIT $4"
        );
        sqlx::query_as::<_, DeliveryAttempt>(&query)
            .bind(DeliveryStatus::Pending.id())
            .bind(after_id)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Attempt counts per channel and status created since `since`.
    pub async fn count_since(
        pool: &PgPool,
        since: Timestamp,
    ) -> Result<Vec<AttemptCount>, sqlx::Error> {
        sqlx::query_as::<_, AttemptCount>(
            "SELECT channel, status_id, COUNT(*) AS count \
             FROM delivery_attempts \
             WHERE created_at >= $1 \
             GROUP BY channel, status_id \
             ORDER BY channel, status_id",
        )
        .bind(since)
        .fetch_all(pool)
        .await
    }
}
