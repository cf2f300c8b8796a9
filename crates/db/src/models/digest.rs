//! Digest window and digest item models.

use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `digest_windows` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct DigestWindow {
    pub id: DbId,
    pub user_id: DbId,
    /// `daily:<YYYY-MM-DD>` or `weekly:<YYYY-MM-DD>`.
    pub window_key: String,
    pub flush_at: Timestamp,
    pub archived_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl DigestWindow {
    /// Cadence label taken from the window key (`daily` or `weekly`).
    pub fn period(&self) -> &str {
        self.window_key
            .split_once(':')
            .map(|(period, _)| period)
            .unwrap_or("daily")
    }
}

/// A digest window a new notification joins, opened on first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPlacement {
    pub window_key: String,
    pub flush_at: Timestamp,
}

/// A `digest_items` row joined with the title of its notification.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct DigestItem {
    pub id: DbId,
    pub window_id: DbId,
    pub notification_id: DbId,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    pub position: i32,
    pub title: String,
}
