//! Integration tests for `Dispatcher::notify` and `Dispatcher::deliver`.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::{EventType, NotificationEvent};
use pitchey_core::rate_limit::ChannelPolicy;
use pitchey_core::types::DbId;
use pitchey_db::models::preference::UserPreference;
use pitchey_events::preferences::{PreferenceError, PreferenceSource};
use pitchey_events::queue::MIN_CAPACITY;
use pitchey_events::{ChannelPolicies, DispatchError, EngineConfig, NotificationStore};

use common::{test_config, Harness, Script};

fn count_status(attempts: &[pitchey_db::models::notification::DeliveryAttempt], status: DeliveryStatus) -> usize {
    attempts.iter().filter(|a| a.status == status).count()
}

// ---------------------------------------------------------------------------
// Test: the same event id is stored once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_event_returns_original_notification() {
    let h = Harness::new();
    h.set_prefs(1, |p| p.email_address = Some("ada@example.com".into()))
        .await;

    let first = h.notify("evt-1", 1, EventType::Message).await;
    let second = h.notify("evt-1", 1, EventType::Message).await;

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.record.id, second.record.id);
    assert_eq!(second.attempts.len(), first.attempts.len());
    assert_eq!(h.store.records_for_user(1).await.len(), 1);
    assert_eq!(h.store.attempts_for_user(1).await.len(), 2);
}

#[tokio::test]
async fn invalid_event_is_rejected() {
    let h = Harness::new();
    let result = h
        .engine
        .dispatcher
        .notify(NotificationEvent::new("  ", 1, EventType::Message))
        .await;
    assert_matches!(result, Err(DispatchError::Validation(_)));

    let result = h
        .engine
        .dispatcher
        .notify(NotificationEvent::new("digest:1", 1, EventType::Message))
        .await;
    assert_matches!(result, Err(DispatchError::Validation(_)));
}

// ---------------------------------------------------------------------------
// Test: hourly limit under concurrent load
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_notifies_respect_hourly_limit() {
    let config = EngineConfig {
        policies: ChannelPolicies::new().with(
            Channel::Push,
            ChannelPolicy {
                hourly_limit: 10,
                burst_limit: 10_000,
                digest_fallback: false,
                ..ChannelPolicy::default_for(Channel::Push)
            },
        ),
        ..test_config()
    };
    let h = Harness::with_config(config);
    h.set_prefs(9, |p| {
        p.in_app_enabled = false;
        p.email_enabled = false;
        p.push_enabled = true;
        p.push_token = Some("device-token".into());
    })
    .await;

    let mut tasks = Vec::new();
    for i in 0..1000 {
        let dispatcher = Arc::clone(&h.engine.dispatcher);
        tasks.push(tokio::spawn(async move {
            dispatcher
                .notify(NotificationEvent::new(format!("view-{i}"), 9, EventType::PitchView))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let attempts = h.store.attempts_for_user(9).await;
    assert_eq!(attempts.len(), 1000);
    assert_eq!(count_status(&attempts, DeliveryStatus::Pending), 10);
    assert_eq!(count_status(&attempts, DeliveryStatus::RateLimited), 990);
    assert!(attempts
        .iter()
        .filter(|a| a.status == DeliveryStatus::RateLimited)
        .all(|a| a.retry_after_secs.is_some_and(|s| s > 0)));
}

// ---------------------------------------------------------------------------
// Test: burst window
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sixth_send_within_burst_window_is_rate_limited() {
    let h = Harness::new();
    h.set_prefs(3, |p| p.email_enabled = false).await;

    let mut statuses = Vec::new();
    for i in 0..6 {
        let outcome = h.notify(&format!("follow-{i}"), 3, EventType::Follow).await;
        assert_eq!(outcome.attempts.len(), 1);
        statuses.push(outcome.attempts[0].status);
    }

    assert_eq!(&statuses[..5], &[DeliveryStatus::Pending; 5]);
    assert_eq!(statuses[5], DeliveryStatus::RateLimited);
}

#[tokio::test]
async fn rate_limited_email_falls_back_to_digest() {
    let config = EngineConfig {
        policies: ChannelPolicies::new().with(
            Channel::Email,
            ChannelPolicy {
                hourly_limit: 1,
                ..ChannelPolicy::default_for(Channel::Email)
            },
        ),
        ..test_config()
    };
    let h = Harness::with_config(config);
    h.set_prefs(4, |p| {
        p.in_app_enabled = false;
        p.email_address = Some("grace@example.com".into());
    })
    .await;

    let first = h.notify("msg-1", 4, EventType::Message).await;
    let second = h.notify("msg-2", 4, EventType::Message).await;

    assert_eq!(first.attempts.len(), 1);
    assert!(second.attempts.is_empty());
    assert_eq!(second.record.channels, vec![Channel::Email]);

    let windows = h.store.windows_for_user(4).await;
    assert_eq!(windows.len(), 1);
    assert!(windows[0].window_key.starts_with("daily:"));
    let items = h.store.list_digest_items(windows[0].id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].notification_id, second.record.id);
}

#[tokio::test]
async fn digest_write_failure_stores_nothing_and_retry_succeeds() {
    let h = Harness::new();
    h.set_prefs(13, |p| {
        p.digest_frequency = pitchey_core::digest::DigestFrequency::Weekly;
        p.email_address = Some("weekly@example.com".into());
    })
    .await;
    h.store.set_digests_available(false);

    let result = h
        .engine
        .dispatcher
        .notify(NotificationEvent::new("msg-weekly", 13, EventType::Message))
        .await;
    assert_matches!(result, Err(DispatchError::Store(_)));
    assert!(h.store.records_for_user(13).await.is_empty());
    assert!(h.store.attempts_for_user(13).await.is_empty());

    // The producer retries the same event once the store recovers.
    h.store.set_digests_available(true);
    let outcome = h.notify("msg-weekly", 13, EventType::Message).await;
    assert!(!outcome.duplicate);
    assert_eq!(outcome.record.channels, vec![Channel::InApp, Channel::Email]);

    let windows = h.store.windows_for_user(13).await;
    assert_eq!(windows.len(), 1);
    assert!(windows[0].window_key.starts_with("weekly:"));
    let items = h.store.list_digest_items(windows[0].id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].notification_id, outcome.record.id);
}

// ---------------------------------------------------------------------------
// Test: NDA request reaches in-app and email, with realtime push
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nda_request_is_sent_on_in_app_and_email() {
    let mut h = Harness::new();
    h.set_prefs(42, |p| p.email_address = Some("founder@example.com".into()))
        .await;

    let event = NotificationEvent::new("nda-7", 42, EventType::NdaRequest).with_payload(
        serde_json::json!({"requester_name": "Acme Capital", "pitch_title": "Solar Roofs"}),
    );
    let outcome = h.engine.dispatcher.notify(event).await.unwrap();
    assert_eq!(outcome.record.channels, vec![Channel::InApp, Channel::Email]);
    assert_eq!(outcome.record.rendered_title, "New NDA request");
    assert!(outcome.record.rendered_body.contains("Acme Capital"));

    let delivered = h.drain().await;
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|a| a.status == DeliveryStatus::Sent));

    let emails = h.sender(Channel::Email).messages();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].recipient.as_deref(), Some("founder@example.com"));

    assert_eq!(h.fanout.pushed(), vec![(42, outcome.record.id)]);
}

#[tokio::test]
async fn security_event_ignores_opt_out() {
    let h = Harness::new();
    h.set_prefs(5, |p| {
        p.email_enabled = false;
        p.in_app_enabled = false;
        p.email_address = Some("x@example.com".into());
        p.opted_out_event_types = vec![EventType::NdaRequest, EventType::Message];
    })
    .await;

    let nda = h.notify("nda-1", 5, EventType::NdaRequest).await;
    assert_eq!(nda.record.channels, vec![Channel::InApp, Channel::Email]);

    let message = h.notify("msg-1", 5, EventType::Message).await;
    assert!(message.record.channels.is_empty());
    assert!(message.attempts.is_empty());
}

// ---------------------------------------------------------------------------
// Test: suppressed channels are skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn suppressed_sms_is_not_attempted() {
    let h = Harness::new();
    h.set_prefs(7, |p| {
        p.sms_enabled = true;
        p.phone_number = Some("+15550001111".into());
    })
    .await;
    h.store
        .suppress_channel(7, Channel::Sms, "carrier rejected number")
        .await
        .unwrap();
    h.engine.resolver.invalidate(7).await;

    let outcome = h.notify("msg-7", 7, EventType::Message).await;

    assert!(!outcome.record.channels.contains(&Channel::Sms));
    assert!(outcome.attempts.iter().all(|a| a.channel != Channel::Sms));
    assert!(outcome.record.channels.contains(&Channel::InApp));
}

#[tokio::test]
async fn channel_without_contact_point_is_skipped() {
    let h = Harness::new();
    // Defaults enable email but no address is on file.
    let outcome = h.notify("msg-1", 11, EventType::Message).await;
    assert_eq!(outcome.record.channels, vec![Channel::InApp]);
}

// ---------------------------------------------------------------------------
// Test: full queue stores nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_rejects_without_persisting() {
    let config = EngineConfig {
        queue_capacity: MIN_CAPACITY,
        ..test_config()
    };
    let h = Harness::with_config(config);

    // One in-app job per follow fills the queue.
    for i in 0..MIN_CAPACITY {
        h.notify(&format!("fill-{i}"), 2, EventType::Follow).await;
    }
    let result = h
        .engine
        .dispatcher
        .notify(NotificationEvent::new("overflow", 2, EventType::Follow))
        .await;

    assert_matches!(result, Err(DispatchError::QueueFull));
    assert_eq!(h.store.records_for_user(2).await.len(), MIN_CAPACITY);
    assert!(h
        .store
        .find_record_by_event_id("overflow")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn queue_smaller_than_channel_count_still_accepts_multi_channel_events() {
    let config = EngineConfig {
        queue_capacity: 1,
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    h.set_prefs(12, |p| p.email_address = Some("small@example.com".into()))
        .await;

    let outcome = h.notify("msg-1", 12, EventType::Message).await;

    assert_eq!(outcome.record.channels, vec![Channel::InApp, Channel::Email]);
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(h.drain().await.len(), 2);
}

// ---------------------------------------------------------------------------
// Test: unavailable preferences degrade to safe defaults
// ---------------------------------------------------------------------------

struct DownSource;

#[async_trait]
impl PreferenceSource for DownSource {
    async fn load(&self, _user_id: DbId) -> Result<Option<UserPreference>, PreferenceError> {
        Err(PreferenceError::Unavailable("connection refused".into()))
    }

    async fn suppressed(&self, _user_id: DbId) -> Result<Vec<Channel>, PreferenceError> {
        Err(PreferenceError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn unavailable_preferences_fall_back_to_in_app() {
    let h = Harness::with_source(test_config(), Arc::new(DownSource));

    let outcome = h.notify("msg-1", 8, EventType::Message).await;

    assert!(outcome.degraded);
    assert_eq!(outcome.record.channels, vec![Channel::InApp]);
    assert_eq!(outcome.attempts.len(), 1);
}

/// Serves one user's preferences until switched off.
struct FlakySource {
    prefs: UserPreference,
    down: AtomicBool,
}

impl FlakySource {
    fn new(user_id: DbId, email: &str, down: bool) -> Arc<Self> {
        let mut prefs = UserPreference::defaults(user_id);
        prefs.email_address = Some(email.into());
        Arc::new(Self {
            prefs,
            down: AtomicBool::new(down),
        })
    }
}

#[async_trait]
impl PreferenceSource for FlakySource {
    async fn load(&self, _user_id: DbId) -> Result<Option<UserPreference>, PreferenceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PreferenceError::Unavailable("connection refused".into()));
        }
        Ok(Some(self.prefs.clone()))
    }

    async fn suppressed(&self, _user_id: DbId) -> Result<Vec<Channel>, PreferenceError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PreferenceError::Unavailable("connection refused".into()));
        }
        Ok(Vec::new())
    }
}

fn uncached_config() -> EngineConfig {
    EngineConfig {
        preference_cache_ttl: Duration::ZERO,
        ..test_config()
    }
}

#[tokio::test]
async fn nda_email_survives_outage_after_a_successful_load() {
    let source = FlakySource::new(21, "founder@example.com", false);
    let mut h = Harness::with_source(uncached_config(), source.clone());

    let up = h.notify("nda-up", 21, EventType::NdaRequest).await;
    assert_eq!(up.record.channels, vec![Channel::InApp, Channel::Email]);
    h.drain().await;

    source.down.store(true, Ordering::SeqCst);
    let down = h.notify("nda-down", 21, EventType::NdaRequest).await;

    assert!(down.degraded);
    assert_eq!(down.record.channels, vec![Channel::InApp, Channel::Email]);
    let email = down
        .attempts
        .iter()
        .find(|a| a.channel == Channel::Email)
        .expect("email attempt");
    assert_eq!(email.recipient.as_deref(), Some("founder@example.com"));

    h.drain().await;
    let sent = h.sender(Channel::Email).messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].recipient.as_deref(), Some("founder@example.com"));
}

#[tokio::test]
async fn nda_email_without_known_address_is_sent_once_preferences_return() {
    let source = FlakySource::new(22, "late@example.com", true);
    let mut h = Harness::with_source(uncached_config(), source.clone());

    let outcome = h.notify("nda-1", 22, EventType::NdaRequest).await;
    assert!(outcome.degraded);
    assert_eq!(outcome.record.channels, vec![Channel::InApp, Channel::Email]);

    let first = h.drain().await;
    let email = first
        .iter()
        .find(|a| a.channel == Channel::Email)
        .expect("email attempt");
    assert_eq!(email.status, DeliveryStatus::Failed);
    assert!(email.next_retry_at.is_some());
    assert!(h.sender(Channel::Email).messages().is_empty());

    source.down.store(false, Ordering::SeqCst);
    let requeued = h
        .engine
        .retry
        .requeue_due(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let retried = h.drain().await;
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].status, DeliveryStatus::Sent);
    let sent = h.sender(Channel::Email).messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient.as_deref(), Some("late@example.com"));
}

// ---------------------------------------------------------------------------
// Test: delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivering_twice_sends_once() {
    let mut h = Harness::new();
    h.set_prefs(6, |p| {
        p.in_app_enabled = false;
        p.email_address = Some("once@example.com".into());
    })
    .await;

    let outcome = h.notify("msg-1", 6, EventType::Message).await;
    let attempt_id = outcome.attempts[0].id;
    h.drain().await;

    let again = h
        .engine
        .dispatcher
        .deliver(pitchey_events::SendJob { attempt_id })
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(h.sender(Channel::Email).messages().len(), 1);
}

#[tokio::test]
async fn transport_error_schedules_retry() {
    let mut h = Harness::new();
    h.set_prefs(10, |p| {
        p.in_app_enabled = false;
        p.email_address = Some("retry@example.com".into());
    })
    .await;
    h.sender(Channel::Email).set_script(Script::Transport);

    h.notify("msg-1", 10, EventType::Message).await;
    let delivered = h.drain().await;

    assert_eq!(delivered.len(), 1);
    let attempt = &delivered[0];
    assert_eq!(attempt.status, DeliveryStatus::Failed);
    assert_eq!(attempt.attempt_count, 1);
    assert!(attempt.next_retry_at.is_some());
    assert!(!attempt.is_terminal());
}
