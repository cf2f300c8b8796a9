//! Repository for the `user_notification_preferences` table.

use pitchey_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::preference::UserPreference;

/// Column list for `user_notification_preferences` queries.
const COLUMNS: &str = "user_id, in_app_enabled, email_enabled, sms_enabled, push_enabled, \
    webhook_enabled, digest_frequency, digest_time, timezone, opted_out_event_types, \
    email_address, phone_number, push_token, webhook_url, dnd_until, updated_at";

/// Provides read and upsert for user preferences.
pub struct PreferenceRepo;

impl PreferenceRepo {
    /// Get a user's saved preferences, if any.
    pub async fn find(pool: &PgPool, user_id: DbId) -> Result<Option<UserPreference>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM user_notification_preferences WHERE user_id = $1");
        sqlx::query_as::<_, UserPreference>(&query)
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert or replace a user's preferences in a single round-trip.
    pub async fn upsert(
        pool: &PgPool,
        prefs: &UserPreference,
    ) -> Result<UserPreference, sqlx::Error> {
        let query = format!(
            "INSERT INTO user_notification_preferences \
                (user_id, in_app_enabled, email_enabled, sms_enabled, push_enabled, webhook_enabled, \
                 digest_frequency, digest_time, timezone, opted_out_event_types, \
                 email_address, phone_number, push_token, webhook_url, dnd_until) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (user_id) DO UPDATE SET \
                in_app_enabled = EXCLUDED.in_app_enabled, \
                email_enabled = EXCLUDED.email_enabled, \
                sms_enabled = EXCLUDED.sms_enabled, \
                push_enabled = EXCLUDED.push_enabled, \
                webhook_enabled = EXCLUDED.webhook_enabled, \
                digest_frequency = EXCLUDED.digest_frequency, \
                digest_time = EXCLUDED.digest_time, \
                timezone = EXCLUDED.timezone, \
                opted_out_event_types = EXCLUDED.opted_out_event_types, \
                email_address = EXCLUDED.email_address, \
                phone_number = EXCLUDED.phone_number, \
                push_token = EXCLUDED.push_token, \
                webhook_url = EXCLUDED.webhook_url, \
                dnd_until = EXCLUDED.dnd_until, \
                updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, UserPreference>(&query)
            .bind(prefs.user_id)
            .bind(prefs.in_app_enabled)
            .bind(prefs.email_enabled)
            .bind(prefs.sms_enabled)
            .bind(prefs.push_enabled)
            .bind(prefs.webhook_enabled)
            .bind(prefs.digest_frequency.as_str())
            .bind(prefs.digest_time)
            .bind(&prefs.timezone)
            .bind(Json(&prefs.opted_out_event_types))
            .bind(&prefs.email_address)
            .bind(&prefs.phone_number)
            .bind(&prefs.push_token)
            .bind(&prefs.webhook_url)
            .bind(prefs.dnd_until)
            .fetch_one(pool)
            .await
    }
}
