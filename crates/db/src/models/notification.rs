//! Notification record and delivery attempt models.

use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `notification_records` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: DbId,
    pub event_id: String,
    pub user_id: DbId,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    /// Channels attempted or queued for this notification.
    #[sqlx(json)]
    pub channels: Vec<Channel>,
    pub variant: Option<String>,
    pub rendered_title: String,
    pub rendered_body: String,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

/// Insert DTO for a notification record.
#[derive(Debug, Clone)]
pub struct NewNotificationRecord {
    pub event_id: String,
    pub user_id: DbId,
    pub event_type: EventType,
    pub channels: Vec<Channel>,
    pub variant: Option<String>,
    pub rendered_title: String,
    pub rendered_body: String,
    pub payload: serde_json::Value,
}

/// A row from the `delivery_attempts` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub id: DbId,
    pub notification_id: DbId,
    pub user_id: DbId,
    #[sqlx(try_from = "String")]
    pub channel: Channel,
    pub recipient: Option<String>,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub last_attempt_at: Option<Timestamp>,
    pub next_retry_at: Option<Timestamp>,
    pub error_reason: Option<String>,
    pub provider_ref: Option<String>,
    pub retry_after_secs: Option<i64>,
    pub sent_at: Option<Timestamp>,
    pub delivered_at: Option<Timestamp>,
    pub failed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DeliveryAttempt {
    /// Whether this attempt can no longer change state.
    pub fn is_terminal(&self) -> bool {
        pitchey_core::delivery::is_terminal(self.status, self.next_retry_at.is_some())
    }
}

/// Insert DTO for a delivery attempt created alongside its record.
#[derive(Debug, Clone)]
pub struct NewDeliveryAttempt {
    pub channel: Channel,
    pub recipient: Option<String>,
    /// Either `pending` or `rate_limited`.
    pub status: DeliveryStatus,
    pub retry_after_secs: Option<i64>,
    pub error_reason: Option<String>,
}

impl NewDeliveryAttempt {
    pub fn pending(channel: Channel, recipient: Option<String>) -> Self {
        Self {
            channel,
            recipient,
            status: DeliveryStatus::Pending,
            retry_after_secs: None,
            error_reason: None,
        }
    }

    pub fn rate_limited(channel: Channel, recipient: Option<String>, retry_after_secs: u64) -> Self {
        Self {
            channel,
            recipient,
            status: DeliveryStatus::RateLimited,
            retry_after_secs: Some(i64::try_from(retry_after_secs).unwrap_or(i64::MAX)),
            error_reason: Some("rate limit exceeded".to_string()),
        }
    }
}

/// Result of inserting a record keyed by its unique `event_id`.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The record was created together with its attempts.
    Created {
        record: NotificationRecord,
        attempts: Vec<DeliveryAttempt>,
    },
    /// Another record already holds the `event_id`; nothing was written.
    Duplicate(NotificationRecord),
}

/// Aggregated attempt count for one `(channel, status)` pair.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct AttemptCount {
    #[sqlx(try_from = "String")]
    pub channel: Channel,
    #[sqlx(rename = "status_id", try_from = "i16")]
    pub status: DeliveryStatus,
    pub count: i64,
}
