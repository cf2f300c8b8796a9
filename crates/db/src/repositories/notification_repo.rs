//! Repository for the `notification_records` table.

use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::digest::DigestPlacement;
use crate::models::notification::{
    DeliveryAttempt, InsertOutcome, NewDeliveryAttempt, NewNotificationRecord, NotificationRecord,
};
use crate::repositories::delivery_attempt_repo::COLUMNS as ATTEMPT_COLUMNS;
use crate::repositories::digest_repo::DigestRepo;

/// Column list for `notification_records` queries.
const COLUMNS: &str = "id, event_id, user_id, event_type, channels, variant, \
    rendered_title, rendered_body, payload, created_at";

/// Same columns qualified with the `r` alias for joins.
const JOINED_COLUMNS: &str = "r.id, r.event_id, r.user_id, r.event_type, r.channels, r.variant, \
    r.rendered_title, r.rendered_body, r.payload, r.created_at";

/// Provides access to notification records and the in-app inbox view.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Find a record by its internal ID.
    pub async fn find_by_id(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<NotificationRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM notification_records WHERE id = $1");
        sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find a record by its producer-supplied idempotency key.
    pub async fn find_by_event_id(
        pool: &PgPool,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM notification_records WHERE event_id = $1");
        sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(event_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert a record, its delivery attempts and its digest items in one
    /// transaction.
    ///
    /// When another record already holds `event_id` the transaction is
    /// rolled back and the existing record is returned as a duplicate.
    pub async fn create_with_attempts(
        pool: &PgPool,
        input: &NewNotificationRecord,
        attempts: &[NewDeliveryAttempt],
        digests: &[DigestPlacement],
    ) -> Result<InsertOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let insert_query = format!(
            "INSERT INTO notification_records \
                (event_id, user_id, event_type, channels, variant, rendered_title, rendered_body, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (event_id) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, NotificationRecord>(&insert_query)
            .bind(&input.event_id)
            .bind(input.user_id)
            .bind(input.event_type.as_str())
            .bind(Json(&input.channels))
            .bind(&input.variant)
            .bind(&input.rendered_title)
            .bind(&input.rendered_body)
            .bind(&input.payload)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(record) = inserted else {
            tx.rollback().await?;
            let existing = Self::find_by_event_id(pool, &input.event_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
            return Ok(InsertOutcome::Duplicate(existing));
        };

        let attempt_query = format!(
            "INSERT INTO delivery_attempts \
                (notification_id, user_id, channel, recipient, status_id, retry_after_secs, error_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {ATTEMPT_COLUMNS}"
        );
        let mut created = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            let row = sqlx::query_as::<_, DeliveryAttempt>(&attempt_query)
                .bind(record.id)
                .bind(record.user_id)
                .bind(attempt.channel.as_str())
                .bind(&attempt.recipient)
                .bind(attempt.status.id())
                .bind(attempt.retry_after_secs)
                .bind(&attempt.error_reason)
                .fetch_one(&mut *tx)
                .await?;
            created.push(row);
        }

        for placement in digests {
            let window = DigestRepo::open_window(
                &mut *tx,
                record.user_id,
                &placement.window_key,
                placement.flush_at,
            )
            .await?;
            DigestRepo::add_item(&mut *tx, window.id, record.id, record.event_type).await?;
        }

        tx.commit().await?;
        Ok(InsertOutcome::Created {
            record,
            attempts: created,
        })
    }

    /// List a user's unread in-app notifications, newest first.
    ///
    /// Unread means the in-app attempt has not yet reached `delivered`.
    pub async fn list_unread_in_app(
        pool: &PgPool,
        user_id: DbId,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, sqlx::Error> {
        let query = format!(
            "SELECT {JOINED_COLUMNS} FROM notification_records r \
             JOIN delivery_attempts a ON a.notification_id = r.id AND a.channel = $2 \
             WHERE r.user_id = $1 AND a.status_id IN ($3, $4) \
             ORDER BY r.created_at DESC, r.id DESC \
             LIMIT $5"
        );
        sqlx::query_as::<_, NotificationRecord>(&query)
            .bind(user_id)
            .bind(Channel::InApp.as_str())
            .bind(DeliveryStatus::Pending.id())
            .bind(DeliveryStatus::Sent.id())
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Count a user's unread in-app notifications.
    pub async fn unread_in_app_count(pool: &PgPool, user_id: DbId) -> Result<i64, sqlx::Error> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM delivery_attempts \
             WHERE user_id = $1 AND channel = $2 AND status_id IN ($3, $4)",
        )
        .bind(user_id)
        .bind(Channel::InApp.as_str())
        .bind(DeliveryStatus::Pending.id())
        .bind(DeliveryStatus::Sent.id())
        .fetch_one(pool)
        .await?;
        Ok(count.unwrap_or(0))
    }
}
