//! Delivery tracker: the single funnel for delivery attempt state changes.
//!
//! Every status change (worker send results, retries, provider callbacks,
//! read receipts) goes through [`DeliveryTracker::transition`], which
//! rejects moves out of terminal states, validates the move against the
//! state graph and persists it with a compare-and-set on the previous
//! status. Bounces and invalid recipients suppress the channel for the
//! user.

use std::sync::Arc;

use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::{validate_transition, DeliveryStatus};
use pitchey_core::retry::RetryPolicy;
use pitchey_core::types::DbId;
use pitchey_db::models::notification::DeliveryAttempt;
use serde::Deserialize;

use crate::preferences::PreferenceResolver;
use crate::store::{NotificationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Delivery attempt not found: {0}")]
    NotFound(String),

    #[error("Delivery attempt {0} is in a terminal state")]
    Terminal(DbId),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("Delivery attempt {0} was modified concurrently")]
    Conflict(DbId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A requested state change and the data that comes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Handed to the provider.
    Sent { provider_ref: String },
    /// Send failed; a retry is scheduled while the budget allows.
    Failed { reason: String },
    /// Send failed for good because the recipient is unusable.
    InvalidRecipient { reason: String },
    /// Confirmed by the provider or read in the UI.
    Delivered,
    /// Rejected by the provider after acceptance.
    Bounced { reason: Option<String> },
    /// A failed attempt going back to the queue.
    Retry,
}

impl Change {
    pub fn target(&self) -> DeliveryStatus {
        match self {
            Change::Sent { .. } => DeliveryStatus::Sent,
            Change::Failed { .. } | Change::InvalidRecipient { .. } => DeliveryStatus::Failed,
            Change::Delivered => DeliveryStatus::Delivered,
            Change::Bounced { .. } => DeliveryStatus::Bounced,
            Change::Retry => DeliveryStatus::Pending,
        }
    }
}

/// Outcome reported by a provider callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Delivered,
    Bounced,
}

pub struct DeliveryTracker {
    store: Arc<dyn NotificationStore>,
    resolver: Arc<PreferenceResolver>,
    retry: RetryPolicy,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        resolver: Arc<PreferenceResolver>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Apply `change` to `attempt` if the stored status still matches.
    pub async fn transition(
        &self,
        attempt: &DeliveryAttempt,
        change: Change,
    ) -> Result<DeliveryAttempt, TrackerError> {
        if attempt.is_terminal() {
            return Err(TrackerError::Terminal(attempt.id));
        }
        let from = attempt.status;
        let to = change.target();
        validate_transition(from, to).map_err(TrackerError::InvalidTransition)?;

        let now = Utc::now();
        let mut next = attempt.clone();
        next.status = to;
        match &change {
            Change::Sent { provider_ref } => {
                next.attempt_count += 1;
                next.last_attempt_at = Some(now);
                next.sent_at = Some(now);
                next.provider_ref = Some(provider_ref.clone());
                next.error_reason = None;
                next.next_retry_at = None;
            }
            Change::Failed { reason } => {
                next.attempt_count += 1;
                next.last_attempt_at = Some(now);
                next.failed_at = Some(now);
                next.error_reason = Some(reason.clone());
                let attempts = u32::try_from(next.attempt_count).unwrap_or(u32::MAX);
                next.next_retry_at = self
                    .retry
                    .delay_after(attempts)
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| now + d);
            }
            Change::InvalidRecipient { reason } => {
                next.attempt_count += 1;
                next.last_attempt_at = Some(now);
                next.failed_at = Some(now);
                next.error_reason = Some(reason.clone());
                next.next_retry_at = None;
            }
            Change::Delivered => {
                next.delivered_at = Some(now);
            }
            Change::Bounced { reason } => {
                next.error_reason = reason.clone().or_else(|| Some("bounced".to_string()));
            }
            Change::Retry => {
                next.next_retry_at = None;
            }
        }

        let updated = self
            .store
            .compare_and_set_attempt(&next, from)
            .await?
            .ok_or(TrackerError::Conflict(attempt.id))?;

        tracing::info!(
            attempt_id = updated.id,
            user_id = updated.user_id,
            channel = %updated.channel,
            from = %from,
            to = %updated.status,
            attempt_count = updated.attempt_count,
            terminal = updated.is_terminal(),
            "Delivery attempt transitioned"
        );

        match &change {
            Change::Bounced { reason } => {
                self.suppress(&updated, reason.as_deref().unwrap_or("bounced"))
                    .await;
            }
            Change::InvalidRecipient { reason } => self.suppress(&updated, reason).await,
            _ => {}
        }

        Ok(updated)
    }

    /// Apply a provider delivery callback. Only `sent` attempts accept one.
    pub async fn apply_callback(
        &self,
        channel: Channel,
        provider_ref: &str,
        status: CallbackStatus,
        reason: Option<String>,
    ) -> Result<DeliveryAttempt, TrackerError> {
        let attempt = self
            .store
            .find_attempt_by_provider_ref(channel, provider_ref)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("{channel} ref {provider_ref}")))?;

        if attempt.status != DeliveryStatus::Sent {
            if attempt.is_terminal() {
                return Err(TrackerError::Terminal(attempt.id));
            }
            return Err(TrackerError::InvalidTransition(format!(
                "Callbacks only apply to sent attempts, attempt {} is {}",
                attempt.id, attempt.status
            )));
        }

        let change = match status {
            CallbackStatus::Delivered => Change::Delivered,
            CallbackStatus::Bounced => Change::Bounced { reason },
        };
        self.transition(&attempt, change).await
    }

    /// Mark the in-app attempts of the user's notifications as delivered
    /// (read). Returns how many changed; notifications of other users and
    /// attempts not yet sent are skipped.
    pub async fn mark_read(
        &self,
        user_id: DbId,
        notification_ids: &[DbId],
    ) -> Result<usize, TrackerError> {
        let mut marked = 0;
        for &notification_id in notification_ids {
            let Some(record) = self.store.find_record(notification_id).await? else {
                continue;
            };
            if record.user_id != user_id {
                continue;
            }
            let Some(attempt) = self
                .store
                .find_attempt_for_channel(notification_id, Channel::InApp)
                .await?
            else {
                continue;
            };
            if attempt.status != DeliveryStatus::Sent {
                continue;
            }
            match self.transition(&attempt, Change::Delivered).await {
                Ok(_) => marked += 1,
                Err(TrackerError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(marked)
    }

    async fn suppress(&self, attempt: &DeliveryAttempt, reason: &str) {
        if attempt.channel == Channel::InApp {
            return;
        }
        match self
            .store
            .suppress_channel(attempt.user_id, attempt.channel, reason)
            .await
        {
            Ok(()) => {
                tracing::warn!(
                    user_id = attempt.user_id,
                    channel = %attempt.channel,
                    reason,
                    "Channel suppressed for user"
                );
                self.resolver.invalidate(attempt.user_id).await;
            }
            Err(e) => {
                tracing::error!(
                    user_id = attempt.user_id,
                    channel = %attempt.channel,
                    error = %e,
                    "Failed to record channel suppression"
                );
            }
        }
    }
}
