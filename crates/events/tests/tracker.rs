//! Integration tests for delivery tracking, callbacks and retries.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::event::EventType;
use pitchey_core::retry::RetryPolicy;
use pitchey_events::tracker::{CallbackStatus, Change};
use pitchey_events::{EngineConfig, NotificationStore, TrackerError};

use common::{provider_ref, test_config, Harness, Script};

async fn email_user(h: &Harness, user_id: i64) {
    h.set_prefs(user_id, |p| {
        p.in_app_enabled = false;
        p.email_address = Some(format!("user{user_id}@example.com"));
    })
    .await;
}

// ---------------------------------------------------------------------------
// Test: terminal states never change
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_in_app_attempt_is_terminal() {
    let mut h = Harness::new();
    let outcome = h.notify("follow-1", 30, EventType::Follow).await;
    h.drain().await;

    let marked = h
        .engine
        .tracker
        .mark_read(30, &[outcome.record.id])
        .await
        .unwrap();
    assert_eq!(marked, 1);

    let attempt = h.attempt(outcome.attempts[0].id).await;
    assert_eq!(attempt.status, DeliveryStatus::Delivered);
    assert!(attempt.delivered_at.is_some());

    let result = h
        .engine
        .tracker
        .transition(&attempt, Change::Bounced { reason: None })
        .await;
    assert_matches!(result, Err(TrackerError::Terminal(_)));
    assert_eq!(h.attempt(attempt.id).await.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn mark_read_skips_other_users() {
    let mut h = Harness::new();
    let outcome = h.notify("follow-1", 31, EventType::Follow).await;
    h.drain().await;

    let marked = h
        .engine
        .tracker
        .mark_read(99, &[outcome.record.id])
        .await
        .unwrap();
    assert_eq!(marked, 0);
    assert_eq!(
        h.attempt(outcome.attempts[0].id).await.status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn stale_transition_conflicts() {
    let mut h = Harness::new();
    email_user(&h, 32).await;
    let outcome = h.notify("msg-1", 32, EventType::Message).await;
    let stale = outcome.attempts[0].clone();
    h.drain().await;

    let result = h
        .engine
        .tracker
        .transition(
            &stale,
            Change::Failed {
                reason: "late worker".into(),
            },
        )
        .await;
    assert_matches!(result, Err(TrackerError::Conflict(_)));
    assert_eq!(h.attempt(stale.id).await.status, DeliveryStatus::Sent);
}

// ---------------------------------------------------------------------------
// Test: provider callbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivered_callback_completes_attempt() {
    let mut h = Harness::new();
    email_user(&h, 33).await;
    let outcome = h.notify("msg-1", 33, EventType::Message).await;
    let attempt_id = outcome.attempts[0].id;
    h.drain().await;

    let attempt = h
        .engine
        .tracker
        .apply_callback(
            Channel::Email,
            &provider_ref(Channel::Email, attempt_id),
            CallbackStatus::Delivered,
            None,
        )
        .await
        .unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Delivered);

    let again = h
        .engine
        .tracker
        .apply_callback(
            Channel::Email,
            &provider_ref(Channel::Email, attempt_id),
            CallbackStatus::Bounced,
            None,
        )
        .await;
    assert_matches!(again, Err(TrackerError::Terminal(_)));
}

#[tokio::test]
async fn bounce_suppresses_channel() {
    let mut h = Harness::new();
    email_user(&h, 34).await;
    let outcome = h.notify("msg-1", 34, EventType::Message).await;
    let attempt_id = outcome.attempts[0].id;
    h.drain().await;

    let attempt = h
        .engine
        .tracker
        .apply_callback(
            Channel::Email,
            &provider_ref(Channel::Email, attempt_id),
            CallbackStatus::Bounced,
            Some("mailbox does not exist".into()),
        )
        .await
        .unwrap();
    assert_eq!(attempt.status, DeliveryStatus::Bounced);
    assert_eq!(attempt.error_reason.as_deref(), Some("mailbox does not exist"));

    let suppressed = h.store.suppressed_channels(34).await.unwrap();
    assert_eq!(suppressed, vec![Channel::Email]);

    let next = h.notify("msg-2", 34, EventType::Message).await;
    assert!(next.attempts.is_empty());
    assert!(!next.record.channels.contains(&Channel::Email));
}

#[tokio::test]
async fn unknown_provider_ref_is_not_found() {
    let h = Harness::new();
    let result = h
        .engine
        .tracker
        .apply_callback(Channel::Sms, "nope", CallbackStatus::Delivered, None)
        .await;
    assert_matches!(result, Err(TrackerError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Test: invalid recipients fail terminally and suppress the channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_recipient_is_terminal() {
    let mut h = Harness::new();
    h.set_prefs(35, |p| {
        p.in_app_enabled = false;
        p.email_enabled = false;
        p.sms_enabled = true;
        p.phone_number = Some("+15550002222".into());
    })
    .await;
    h.sender(Channel::Sms).set_script(Script::InvalidRecipient);

    h.notify("msg-1", 35, EventType::Message).await;
    let delivered = h.drain().await;

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].status, DeliveryStatus::Failed);
    assert!(delivered[0].next_retry_at.is_none());
    assert!(delivered[0].is_terminal());
    assert_eq!(
        h.store.suppressed_channels(35).await.unwrap(),
        vec![Channel::Sms]
    );
}

// ---------------------------------------------------------------------------
// Test: retries follow the backoff schedule
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_attempt_is_retried_after_backoff() {
    let mut h = Harness::new();
    email_user(&h, 36).await;
    h.sender(Channel::Email).set_script(Script::Transport);

    let outcome = h.notify("msg-1", 36, EventType::Message).await;
    let attempt_id = outcome.attempts[0].id;
    h.drain().await;

    let failed = h.attempt(attempt_id).await;
    let first_retry = failed.next_retry_at.unwrap();
    let delay = first_retry - failed.last_attempt_at.unwrap();
    assert_eq!(delay.num_seconds(), 30);

    // Not yet due.
    assert_eq!(h.engine.retry.requeue_due(Utc::now()).await.unwrap(), 0);

    let requeued = h
        .engine
        .retry
        .requeue_due(first_retry + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(requeued, 1);
    assert_eq!(h.attempt(attempt_id).await.status, DeliveryStatus::Pending);

    h.drain().await;
    let failed_again = h.attempt(attempt_id).await;
    assert_eq!(failed_again.attempt_count, 2);
    let delay = failed_again.next_retry_at.unwrap() - failed_again.last_attempt_at.unwrap();
    assert_eq!(delay.num_seconds(), 60);

    h.sender(Channel::Email).set_script(Script::Accept);
    h.engine
        .retry
        .requeue_due(failed_again.next_retry_at.unwrap() + Duration::seconds(1))
        .await
        .unwrap();
    h.drain().await;

    let sent = h.attempt(attempt_id).await;
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.attempt_count, 3);
    assert_eq!(h.sender(Channel::Email).messages().len(), 3);
}

#[tokio::test]
async fn retry_budget_exhaustion_is_terminal() {
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        },
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    email_user(&h, 37).await;
    h.sender(Channel::Email).set_script(Script::Transport);

    let outcome = h.notify("msg-1", 37, EventType::Message).await;
    let attempt_id = outcome.attempts[0].id;
    h.drain().await;

    let first = h.attempt(attempt_id).await;
    h.engine
        .retry
        .requeue_due(first.next_retry_at.unwrap() + Duration::seconds(1))
        .await
        .unwrap();
    h.drain().await;

    let last = h.attempt(attempt_id).await;
    assert_eq!(last.status, DeliveryStatus::Failed);
    assert_eq!(last.attempt_count, 2);
    assert!(last.next_retry_at.is_none());
    assert!(last.is_terminal());

    let later = Utc::now() + Duration::days(1);
    assert_eq!(h.engine.retry.requeue_due(later).await.unwrap(), 0);
}

#[tokio::test]
async fn orphaned_pending_attempts_are_recovered() {
    let mut h = Harness::new();
    let outcome = h.notify("follow-1", 38, EventType::Follow).await;

    // Simulate a restart: the queued job is lost.
    while h.rx.try_recv().is_ok() {}

    let recovered = h.engine.retry.recover_orphans().await.unwrap();
    assert_eq!(recovered, 1);

    h.drain().await;
    assert_eq!(
        h.attempt(outcome.attempts[0].id).await.status,
        DeliveryStatus::Sent
    );
}

#[tokio::test]
async fn orphan_recovery_pages_past_the_batch_size() {
    let config = EngineConfig {
        batch_size: 2,
        ..test_config()
    };
    let mut h = Harness::with_config(config);
    let mut ids = Vec::new();
    for user_id in 40..45 {
        let outcome = h.notify(&format!("follow-{user_id}"), user_id, EventType::Follow).await;
        ids.push(outcome.attempts[0].id);
    }
    while h.rx.try_recv().is_ok() {}

    let recovered = h.engine.retry.recover_orphans().await.unwrap();
    assert_eq!(recovered, 5);

    let delivered = h.drain().await;
    assert_eq!(delivered.len(), 5);
    for id in ids {
        assert_eq!(h.attempt(id).await.status, DeliveryStatus::Sent);
    }
}

#[tokio::test]
async fn stale_pending_attempts_are_swept_while_running() {
    let mut h = Harness::new();
    let outcome = h.notify("follow-1", 46, EventType::Follow).await;
    // The job was taken by a worker that never reported back.
    while h.rx.try_recv().is_ok() {}

    // Younger than the sweep age: left alone.
    assert_eq!(h.engine.retry.sweep_stale(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::minutes(10);
    assert_eq!(h.engine.retry.sweep_stale(later).await.unwrap(), 1);

    h.drain().await;
    assert_eq!(
        h.attempt(outcome.attempts[0].id).await.status,
        DeliveryStatus::Sent
    );
}
