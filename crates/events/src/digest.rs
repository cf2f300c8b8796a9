//! Digest scheduler.
//!
//! [`DigestScheduler`] runs as a background task. On every tick it loads
//! the digest windows whose `flush_at` has passed and turns each one into a
//! single email: items are grouped by event type in first-seen order,
//! rendered into one body, stored as a digest notification with event id
//! `digest:<window id>` and handed to the send workers. Empty windows are
//! archived without sending anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::{EventType, DIGEST_EVENT_PREFIX};
use pitchey_core::render::{render_digest, DigestSection};
use pitchey_core::types::{DbId, Timestamp};
use pitchey_db::models::digest::{DigestItem, DigestWindow};
use pitchey_db::models::notification::{InsertOutcome, NewDeliveryAttempt, NewNotificationRecord};
use tokio_util::sync::CancellationToken;

use crate::delivery::SenderRegistry;
use crate::queue::{QueueError, SendJob, SendQueue};
use crate::rate_limit::RateLimiter;
use crate::store::{NotificationStore, StoreError};

/// What happened to one due window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The digest email attempt was stored and enqueued.
    Sent { attempt_id: DbId },
    /// No items; archived without sending.
    Empty,
    /// The user cannot receive email (no address, suppressed or no email
    /// sender); archived without sending.
    Dropped,
    /// Email rate limit reached; flush moved to the given time.
    Rescheduled(Timestamp),
    /// No queue capacity; left due for the next tick.
    Deferred,
}

/// Group items by event type, keeping the order in which each type first
/// appeared.
pub fn group_items(items: &[DigestItem]) -> Vec<DigestSection> {
    let mut sections: Vec<DigestSection> = Vec::new();
    for item in items {
        match sections.iter_mut().find(|s| s.event_type == item.event_type) {
            Some(section) => section.lines.push(item.title.clone()),
            None => sections.push(DigestSection {
                event_type: item.event_type,
                lines: vec![item.title.clone()],
            }),
        }
    }
    sections
}

/// Background service that flushes due digest windows.
pub struct DigestScheduler {
    store: Arc<dyn NotificationStore>,
    limiter: Arc<RateLimiter>,
    senders: SenderRegistry,
    queue: SendQueue,
    batch_size: i64,
    interval: Duration,
}

impl DigestScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        limiter: Arc<RateLimiter>,
        senders: SenderRegistry,
        queue: SendQueue,
        batch_size: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            limiter,
            senders,
            queue,
            batch_size,
            interval,
        }
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        tracing::info!(interval_secs = self.interval.as_secs(), "Digest scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Digest scheduler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.flush_due(Utc::now()).await {
                        tracing::error!(error = %e, "Failed to process digests");
                    }
                }
            }
        }
    }

    /// Flush every window due at `now`. A failure on one window is logged
    /// and does not stop the others.
    pub async fn flush_due(&self, now: Timestamp) -> Result<Vec<(DbId, FlushOutcome)>, StoreError> {
        let windows = self
            .store
            .list_due_digest_windows(now, self.batch_size)
            .await?;

        let mut outcomes = Vec::with_capacity(windows.len());
        for window in &windows {
            match self.flush_window(window, now).await {
                Ok(outcome) => outcomes.push((window.id, outcome)),
                Err(e) => tracing::error!(
                    window_id = window.id,
                    user_id = window.user_id,
                    error = %e,
                    "Failed to flush digest window"
                ),
            }
        }

        let sent = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, FlushOutcome::Sent { .. }))
            .count();
        if sent > 0 {
            tracing::info!(count = sent, "Digests flushed");
        }
        Ok(outcomes)
    }

    async fn flush_window(
        &self,
        window: &DigestWindow,
        now: Timestamp,
    ) -> Result<FlushOutcome, StoreError> {
        let items = self.store.list_digest_items(window.id).await?;
        if items.is_empty() {
            self.store.archive_digest_window(window.id).await?;
            tracing::debug!(window_id = window.id, "Empty digest window archived");
            return Ok(FlushOutcome::Empty);
        }

        let Some(recipient) = self.email_recipient(window.user_id).await? else {
            self.store.archive_digest_window(window.id).await?;
            tracing::warn!(
                window_id = window.id,
                user_id = window.user_id,
                item_count = items.len(),
                "Digest dropped, user cannot receive email"
            );
            return Ok(FlushOutcome::Dropped);
        };

        let mut reservation = match self.queue.reserve(1).await {
            Ok(r) => r,
            Err(QueueError::Full) | Err(QueueError::Closed) => {
                tracing::warn!(window_id = window.id, "Send queue unavailable, digest deferred");
                return Ok(FlushOutcome::Deferred);
            }
        };

        let decision = self
            .limiter
            .check_at(window.user_id, Channel::Email, now)
            .await;
        if !decision.allowed {
            let retry_after = chrono::Duration::from_std(decision.retry_after)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            let flush_at = now + retry_after;
            self.store
                .reschedule_digest_window(window.id, flush_at)
                .await?;
            tracing::info!(window_id = window.id, %flush_at, "Digest rate limited, rescheduled");
            return Ok(FlushOutcome::Rescheduled(flush_at));
        }

        let sections = group_items(&items);
        let (title, body) = render_digest(window.period(), &sections);
        let notification_ids: Vec<DbId> = items.iter().map(|i| i.notification_id).collect();

        let record = NewNotificationRecord {
            event_id: format!("{DIGEST_EVENT_PREFIX}{}", window.id),
            user_id: window.user_id,
            event_type: EventType::Digest,
            channels: vec![Channel::Email],
            variant: None,
            rendered_title: title,
            rendered_body: body,
            payload: serde_json::json!({
                "windowId": window.id,
                "windowKey": window.window_key,
                "itemCount": items.len(),
                "notificationIds": notification_ids,
            }),
        };
        let attempt = NewDeliveryAttempt::pending(Channel::Email, Some(recipient));

        let attempt_id = match self.store.insert_record(&record, &[attempt], &[]).await? {
            InsertOutcome::Created { attempts, .. } => attempts.first().map(|a| a.id),
            // Flushed before but not archived: resume the stored attempt.
            InsertOutcome::Duplicate(existing) => self
                .store
                .find_attempt_for_channel(existing.id, Channel::Email)
                .await?
                .filter(|a| a.status == DeliveryStatus::Pending)
                .map(|a| a.id),
        };

        self.store.archive_digest_window(window.id).await?;

        match attempt_id {
            Some(attempt_id) => {
                reservation.send(SendJob { attempt_id });
                tracing::info!(
                    window_id = window.id,
                    user_id = window.user_id,
                    item_count = items.len(),
                    attempt_id,
                    "Digest queued"
                );
                Ok(FlushOutcome::Sent { attempt_id })
            }
            None => Ok(FlushOutcome::Empty),
        }
    }

    /// The user's email address, unless email is unavailable to them.
    async fn email_recipient(&self, user_id: DbId) -> Result<Option<String>, StoreError> {
        if !self.senders.contains(Channel::Email) {
            return Ok(None);
        }
        if self
            .store
            .suppressed_channels(user_id)
            .await?
            .contains(&Channel::Email)
        {
            return Ok(None);
        }
        let prefs = self.store.find_preferences(user_id).await?;
        Ok(prefs.and_then(|p| p.email_address).filter(|a| !a.trim().is_empty()))
    }
}
