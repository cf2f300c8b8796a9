//! Repository for the `channel_suppressions` table.

use pitchey_core::channels::Channel;
use pitchey_core::types::DbId;
use sqlx::PgPool;

use crate::models::preference::ChannelSuppression;

/// Provides access to per-user channel suppressions.
pub struct SuppressionRepo;

impl SuppressionRepo {
    /// Suppress a channel for a user. The first recorded reason is kept.
    pub async fn suppress(
        pool: &PgPool,
        user_id: DbId,
        channel: Channel,
        reason: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO channel_suppressions (user_id, channel, reason) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, channel) DO NOTHING",
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// List the suppressions recorded for a user.
    pub async fn list_for_user(
        pool: &PgPool,
        user_id: DbId,
    ) -> Result<Vec<ChannelSuppression>, sqlx::Error> {
        sqlx::query_as::<_, ChannelSuppression>(
            "SELECT user_id, channel, reason, created_at FROM channel_suppressions \
             WHERE user_id = $1 \
             ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
    }
}
