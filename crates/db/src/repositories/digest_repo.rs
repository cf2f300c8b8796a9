//! Repository for the `digest_windows` and `digest_items` tables.

use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use sqlx::{PgExecutor, PgPool};

use crate::models::digest::{DigestItem, DigestWindow};

/// Column list for `digest_windows` queries.
const WINDOW_COLUMNS: &str = "id, user_id, window_key, flush_at, archived_at, created_at";

/// Provides window and item operations for the digest batcher.
pub struct DigestRepo;

impl DigestRepo {
    /// Return the open window for `(user_id, window_key)`, creating it with
    /// `flush_at` when none exists.
    pub async fn open_window<'e>(
        executor: impl PgExecutor<'e>,
        user_id: DbId,
        window_key: &str,
        flush_at: Timestamp,
    ) -> Result<DigestWindow, sqlx::Error> {
        let query = format!(
            "INSERT INTO digest_windows (user_id, window_key, flush_at) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, window_key) WHERE archived_at IS NULL \
             DO UPDATE SET flush_at = digest_windows.flush_at \
             RETURNING {WINDOW_COLUMNS}"
        );
        sqlx::query_as::<_, DigestWindow>(&query)
            .bind(user_id)
            .bind(window_key)
            .bind(flush_at)
            .fetch_one(executor)
            .await
    }

    /// Append a notification to a window at the next position.
    ///
    /// Appending the same notification twice is a no-op.
    pub async fn add_item<'e>(
        executor: impl PgExecutor<'e>,
        window_id: DbId,
        notification_id: DbId,
        event_type: EventType,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO digest_items (window_id, notification_id, event_type, position) \
             SELECT $1, $2, $3, COALESCE(MAX(position), 0) + 1 \
             FROM digest_items WHERE window_id = $1 \
             ON CONFLICT (window_id, notification_id) DO NOTHING",
        )
        .bind(window_id)
        .bind(notification_id)
        .bind(event_type.as_str())
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Open windows whose flush time has passed, earliest first.
    pub async fn list_due(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<DigestWindow>, sqlx::Error> {
        let query = format!(
            "SELECT {WINDOW_COLUMNS} FROM digest_windows \
             WHERE archived_at IS NULL AND flush_at <= $1 \
             ORDER BY flush_at, id \
             LIMIT $2"
        );
        sqlx::query_as::<_, DigestWindow>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Items of a window in insertion order, with their rendered titles.
    pub async fn list_items(
        pool: &PgPool,
        window_id: DbId,
    ) -> Result<Vec<DigestItem>, sqlx::Error> {
        sqlx::query_as::<_, DigestItem>(
            "SELECT i.id, i.window_id, i.notification_id, i.event_type, i.position, \
                    r.rendered_title AS title \
             FROM digest_items i \
             JOIN notification_records r ON r.id = i.notification_id \
             WHERE i.window_id = $1 \
             ORDER BY i.position, i.id",
        )
        .bind(window_id)
        .fetch_all(pool)
        .await
    }

    /// Move an open window's flush time.
    pub async fn reschedule(
        pool: &PgPool,
        window_id: DbId,
        flush_at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE digest_windows SET flush_at = $2 \
             WHERE id = $1 AND archived_at IS NULL",
        )
        .bind(window_id)
        .bind(flush_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Archive an open window.
    ///
    /// Returns `false` if the window was already archived.
    pub async fn archive(pool: &PgPool, window_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE digest_windows SET archived_at = NOW() \
             WHERE id = $1 AND archived_at IS NULL",
        )
        .bind(window_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
