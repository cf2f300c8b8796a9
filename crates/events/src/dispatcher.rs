//! Notification dispatcher and send workers.
//!
//! [`Dispatcher::notify`] turns one inbound event into a stored
//! notification:
//!
//! 1. idempotency on `event_id`;
//! 2. preference resolution;
//! 3. queue capacity reservation for the instant channels;
//! 4. per channel rate limiting, with digest fallback where the channel
//!    policy allows it;
//! 5. A/B variant assignment and rendering;
//! 6. one transactional insert of the record, its attempts and its digest
//!    items;
//! 7. send jobs for pending attempts.
//!
//! [`DispatchWorkers`] drain the send queue and call
//! [`Dispatcher::deliver`], which sends through the channel's sender and
//! reports the result to the [`DeliveryTracker`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::digest::DigestFrequency;
use pitchey_core::error::CoreError;
use pitchey_core::event::NotificationEvent;
use pitchey_core::render::render_content;
use pitchey_core::types::DbId;
use pitchey_db::models::digest::DigestPlacement;
use pitchey_db::models::notification::{
    DeliveryAttempt, InsertOutcome, NewDeliveryAttempt, NewNotificationRecord, NotificationRecord,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChannelPolicies;
use crate::delivery::{OutboundMessage, SendError, SenderRegistry};
use crate::experiments::ExperimentRegistry;
use crate::fanout::RealtimeFanout;
use crate::preferences::{DeliveryMode, PreferenceResolver};
use crate::queue::{QueueError, SendJob, SendQueue};
use crate::rate_limit::RateLimiter;
use crate::store::{NotificationStore, StoreError};
use crate::tracker::{Change, DeliveryTracker, TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// No queue capacity within the enqueue timeout. Nothing was stored.
    #[error("Send queue is full, retry later")]
    QueueFull,

    #[error("Dispatcher is shutting down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full => DispatchError::QueueFull,
            QueueError::Closed => DispatchError::Closed,
        }
    }
}

/// Result of [`Dispatcher::notify`].
#[derive(Debug, Clone)]
pub struct NotifyOutcome {
    pub record: NotificationRecord,
    pub attempts: Vec<DeliveryAttempt>,
    /// The event was seen before; `record` is the original.
    pub duplicate: bool,
    /// Preferences were unavailable and safe defaults were used.
    pub degraded: bool,
}

/// Removes an attempt id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<DbId>>,
    attempt_id: DbId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<DbId>>, attempt_id: DbId) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(attempt_id).then_some(Self { set, attempt_id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.attempt_id);
    }
}

/// Entry point for event producers and the send workers.
pub struct Dispatcher {
    pub(crate) store: Arc<dyn NotificationStore>,
    pub(crate) resolver: Arc<PreferenceResolver>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) experiments: Arc<ExperimentRegistry>,
    pub(crate) senders: SenderRegistry,
    pub(crate) tracker: Arc<DeliveryTracker>,
    pub(crate) fanout: Arc<dyn RealtimeFanout>,
    pub(crate) queue: SendQueue,
    pub(crate) policies: ChannelPolicies,
    pub(crate) send_timeout: Duration,
    pub(crate) in_flight: Mutex<HashSet<DbId>>,
}

impl Dispatcher {
    /// Store a notification for `event` and queue its instant deliveries.
    pub async fn notify(&self, event: NotificationEvent) -> Result<NotifyOutcome, DispatchError> {
        event.validate()?;

        if let Some(existing) = self.store.find_record_by_event_id(&event.event_id).await? {
            tracing::debug!(event_id = %event.event_id, "Duplicate event, returning stored notification");
            return self.replay(existing).await;
        }

        let now = Utc::now();
        let user_id = event.user_id;
        let resolution = self.resolver.resolve(user_id, event.event_type).await;
        let security = event.event_type.is_security_relevant();

        let mut instant = Vec::new();
        let mut batched: Vec<DigestFrequency> = Vec::new();
        for route in resolution.routes {
            if !self.policies.get(route.channel).enabled {
                tracing::debug!(user_id, channel = %route.channel, "Channel disabled by policy");
                continue;
            }
            match route.mode {
                DeliveryMode::Instant => {
                    if !self.senders.contains(route.channel) {
                        tracing::debug!(user_id, channel = %route.channel, "No sender configured, skipping channel");
                        continue;
                    }
                    if route.channel != Channel::InApp && route.recipient.is_none() {
                        // Security email outlives a preference outage; the
                        // address is looked up again when the job runs.
                        if security && resolution.degraded && route.channel == Channel::Email {
                            tracing::warn!(user_id, "Email contact unknown, resolving it at send time");
                        } else {
                            tracing::debug!(user_id, channel = %route.channel, "No contact point, skipping channel");
                            continue;
                        }
                    }
                    instant.push(route);
                }
                DeliveryMode::Digest(frequency) => {
                    if self.senders.contains(Channel::Email) {
                        batched.push(frequency);
                    }
                }
            }
        }

        // Reserve capacity first so a full queue costs no rate limit budget
        // and stores nothing.
        let mut reservation = self.queue.reserve(instant.len()).await?;

        let mut channels: Vec<Channel> = Vec::new();
        let mut attempts = Vec::new();
        for route in instant {
            let channel = route.channel;
            let decision = self.limiter.check_and_increment(user_id, channel).await;
            if decision.allowed {
                attempts.push(NewDeliveryAttempt::pending(channel, route.recipient));
                channels.push(channel);
                continue;
            }

            let policy = self.policies.get(channel);
            if policy.digest_fallback && self.senders.contains(Channel::Email) {
                tracing::info!(
                    user_id,
                    %channel,
                    retry_after_secs = decision.retry_after_secs(),
                    "Rate limited, deferring to digest"
                );
                batched.push(resolution.schedule.fallback_frequency());
            } else {
                tracing::info!(
                    user_id,
                    %channel,
                    retry_after_secs = decision.retry_after_secs(),
                    "Rate limited"
                );
                attempts.push(NewDeliveryAttempt::rate_limited(
                    channel,
                    route.recipient,
                    decision.retry_after_secs(),
                ));
                channels.push(channel);
            }
        }
        batched.sort_by_key(|f| f.as_str());
        batched.dedup();
        let digests: Vec<DigestPlacement> = batched
            .into_iter()
            .filter_map(|frequency| {
                let slot = resolution.schedule.slot(frequency, now);
                if slot.is_none() {
                    tracing::warn!(user_id, %frequency, "No digest window for frequency");
                }
                slot
            })
            .map(|slot| DigestPlacement {
                window_key: slot.window_key,
                flush_at: slot.flush_at,
            })
            .collect();
        if !digests.is_empty() && !channels.contains(&Channel::Email) {
            channels.push(Channel::Email);
        }
        channels.sort();

        let assignment = self.experiments.assign(event.event_type, user_id);
        let (title, body) = render_content(
            event.event_type,
            &event.payload,
            assignment.and_then(|(_, v)| v.title_template.as_deref()),
            assignment.and_then(|(_, v)| v.body_template.as_deref()),
        );
        let variant = assignment.map(|(_, v)| v.id.clone());

        let new_record = NewNotificationRecord {
            event_id: event.event_id.clone(),
            user_id,
            event_type: event.event_type,
            channels,
            variant,
            rendered_title: title,
            rendered_body: body,
            payload: event.payload,
        };

        let (record, stored) = match self
            .store
            .insert_record(&new_record, &attempts, &digests)
            .await?
        {
            InsertOutcome::Created { record, attempts } => (record, attempts),
            InsertOutcome::Duplicate(existing) => {
                tracing::debug!(event_id = %event.event_id, "Lost insert race to a duplicate event");
                return self.replay(existing).await;
            }
        };

        for attempt in stored.iter().filter(|a| a.status == DeliveryStatus::Pending) {
            reservation.send(SendJob {
                attempt_id: attempt.id,
            });
        }

        tracing::info!(
            notification_id = record.id,
            user_id,
            event_type = %record.event_type,
            channels = ?record.channels,
            digests = digests.len(),
            degraded = resolution.degraded,
            "Notification dispatched"
        );

        Ok(NotifyOutcome {
            record,
            attempts: stored,
            duplicate: false,
            degraded: resolution.degraded,
        })
    }

    async fn replay(&self, record: NotificationRecord) -> Result<NotifyOutcome, DispatchError> {
        let attempts = self.store.list_attempts(record.id).await?;
        Ok(NotifyOutcome {
            record,
            attempts,
            duplicate: true,
            degraded: false,
        })
    }

    /// Send one queued attempt and record the outcome.
    ///
    /// Returns `Ok(None)` when there is nothing to do: the attempt is
    /// already being sent by another worker or is no longer pending.
    pub async fn deliver(&self, job: SendJob) -> Result<Option<DeliveryAttempt>, TrackerError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, job.attempt_id) else {
            tracing::debug!(attempt_id = job.attempt_id, "Attempt already in flight");
            return Ok(None);
        };

        let attempt = self
            .store
            .find_attempt(job.attempt_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("attempt {}", job.attempt_id)))?;
        if attempt.status != DeliveryStatus::Pending {
            tracing::debug!(attempt_id = attempt.id, status = %attempt.status, "Attempt no longer pending");
            return Ok(None);
        }
        let record = self
            .store
            .find_record(attempt.notification_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("notification {}", attempt.notification_id)))?;

        let Some(sender) = self.senders.get(attempt.channel) else {
            let change = Change::Failed {
                reason: format!("no sender configured for {}", attempt.channel),
            };
            return self.tracker.transition(&attempt, change).await.map(Some);
        };

        let mut recipient = attempt.recipient.clone();
        if recipient.is_none() && attempt.channel != Channel::InApp {
            match self.resolver.contact(attempt.user_id, attempt.channel).await {
                Ok(found) => recipient = found,
                Err(e) => {
                    let change = Change::Failed {
                        reason: format!("contact point unavailable: {e}"),
                    };
                    return self.tracker.transition(&attempt, change).await.map(Some);
                }
            }
        }

        let message = OutboundMessage {
            attempt_id: attempt.id,
            notification_id: record.id,
            user_id: record.user_id,
            channel: attempt.channel,
            recipient,
            event_type: record.event_type,
            title: record.rendered_title.clone(),
            body: record.rendered_body.clone(),
            payload: record.payload.clone(),
        };

        let result = tokio::time::timeout(self.send_timeout, sender.send(&message))
            .await
            .unwrap_or_else(|_| Err(SendError::Transport("send timed out".into())));

        let change = match result {
            Ok(receipt) => Change::Sent {
                provider_ref: receipt.provider_ref,
            },
            Err(SendError::InvalidRecipient(reason)) => {
                tracing::warn!(attempt_id = attempt.id, channel = %attempt.channel, %reason, "Invalid recipient");
                Change::InvalidRecipient { reason }
            }
            Err(SendError::Transport(reason)) => {
                tracing::warn!(attempt_id = attempt.id, channel = %attempt.channel, %reason, "Send failed");
                Change::Failed { reason }
            }
        };

        let updated = self.tracker.transition(&attempt, change).await?;
        if updated.status == DeliveryStatus::Sent && updated.channel == Channel::InApp {
            let reached = self.fanout.push(record.user_id, &record).await;
            tracing::debug!(notification_id = record.id, user_id = record.user_id, reached, "Realtime push");
        }
        Ok(Some(updated))
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Pool of tasks draining the send queue.
pub struct DispatchWorkers;

impl DispatchWorkers {
    /// Spawn `count` workers sharing `rx`. Workers stop taking jobs once
    /// `cancel` fires; a send already in progress completes first.
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        rx: mpsc::Receiver<SendJob>,
        count: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..count.max(1))
            .map(|worker| {
                let dispatcher = Arc::clone(&dispatcher);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Send worker started");
                    loop {
                        let job = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        let Some(job) = job else { break };
                        if let Err(e) = dispatcher.deliver(job).await {
                            tracing::error!(worker, attempt_id = job.attempt_id, error = %e, "Delivery failed");
                        }
                    }
                    tracing::debug!(worker, "Send worker stopped");
                })
            })
            .collect()
    }
}
