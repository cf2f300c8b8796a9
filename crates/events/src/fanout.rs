//! Realtime fan-out of in-app notifications to live sessions.
//!
//! The engine only knows this trait; the HTTP server implements it with its
//! WebSocket room registry.

use async_trait::async_trait;
use pitchey_core::types::DbId;
use pitchey_db::models::notification::NotificationRecord;

/// Best-effort push to a user's open connections.
#[async_trait]
pub trait RealtimeFanout: Send + Sync {
    /// Push `record` to every live connection of `user_id`, returning how
    /// many connections it was handed to. Never fails: the inbox entry is
    /// the durable copy.
    async fn push(&self, user_id: DbId, record: &NotificationRecord) -> usize;
}

/// Fan-out used when no realtime transport is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFanout;

#[async_trait]
impl RealtimeFanout for NoopFanout {
    async fn push(&self, _user_id: DbId, _record: &NotificationRecord) -> usize {
        0
    }
}
