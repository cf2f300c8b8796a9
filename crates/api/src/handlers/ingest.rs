//! Internal endpoints for event producers and provider callbacks.
//!
//! Callers authenticate with the shared `X-Internal-Token`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use pitchey_core::channels::Channel;
use pitchey_core::event::{EventType, NotificationEvent};
use pitchey_core::types::DbId;
use pitchey_events::tracker::CallbackStatus;
use serde::Deserialize;
use serde_json::json;

use crate::error::AppResult;
use crate::middleware::internal::InternalCaller;
use crate::state::AppState;

/// Request body for `POST /internal/notifications`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub event_id: String,
    pub user_id: DbId,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Request body for `POST /internal/notifications/callbacks/{channel}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub provider_ref: String,
    pub status: CallbackStatus,
    pub reason: Option<String>,
}

/// POST /internal/notifications
///
/// Returns 202 when the notification was accepted and 200 when the event
/// id was seen before (the original notification is returned).
pub async fn ingest_event(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Json(input): Json<IngestRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let event = NotificationEvent::new(input.event_id, input.user_id, input.event_type)
        .with_payload(input.payload.unwrap_or_else(|| json!({})));

    let outcome = state.engine.dispatcher.notify(event).await?;

    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let attempts: Vec<_> = outcome
        .attempts
        .iter()
        .map(|a| json!({"id": a.id, "channel": a.channel, "status": a.status}))
        .collect();

    Ok((
        status,
        Json(json!({
            "data": {
                "notificationId": outcome.record.id,
                "duplicate": outcome.duplicate,
                "degraded": outcome.degraded,
                "channels": outcome.record.channels,
                "attempts": attempts,
            }
        })),
    ))
}

/// POST /internal/notifications/callbacks/{channel}
///
/// Apply a provider delivery receipt to the matching `sent` attempt.
pub async fn provider_callback(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Json(input): Json<CallbackRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let channel: Channel = channel.parse()?;

    let attempt = state
        .engine
        .tracker
        .apply_callback(channel, &input.provider_ref, input.status, input.reason)
        .await?;

    tracing::info!(
        attempt_id = attempt.id,
        channel = %channel,
        status = %attempt.status,
        "Provider callback applied"
    );
    Ok(Json(json!({ "data": attempt })))
}
