//! Handlers for the `/api/notifications` resource.
//!
//! All endpoints require authentication via [`AuthUser`].

use axum::extract::{Path, Query, State};
use axum::Json;
use pitchey_core::error::CoreError;
use pitchey_core::types::DbId;
use pitchey_db::models::preference::{UpdatePreferences, UserPreference};
use serde::Deserialize;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query / request types
// ---------------------------------------------------------------------------

/// Query parameters for `GET /unread`.
#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
}

/// Maximum page size for the unread inbox.
const MAX_LIMIT: i64 = 100;

/// Default page size for the unread inbox.
const DEFAULT_LIMIT: i64 = 50;

/// Request body for `PUT /mark-read`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[validate(length(min = 1, max = 500))]
    pub notification_ids: Vec<DbId>,
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// GET /api/notifications/unread
///
/// Newest unread in-app notifications of the authenticated user.
pub async fn list_unread(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<UnreadQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let notifications = state
        .engine
        .store
        .list_unread_in_app(auth.user_id, limit)
        .await?;

    Ok(Json(serde_json::json!({ "data": notifications })))
}

/// GET /api/notifications/unread-count
pub async fn unread_count(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<serde_json::Value>> {
    let count = state.engine.store.unread_in_app_count(auth.user_id).await?;

    Ok(Json(serde_json::json!({ "data": { "count": count } })))
}

/// PUT /api/notifications/mark-read
///
/// Mark in-app notifications as read. Ids of other users' notifications
/// are ignored; the response reports how many changed.
pub async fn mark_read(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(input): Json<MarkReadRequest>,
) -> AppResult<Json<serde_json::Value>> {
    input.validate()?;

    let marked = state
        .engine
        .tracker
        .mark_read(auth.user_id, &input.notification_ids)
        .await?;

    tracing::debug!(user_id = auth.user_id, marked, "Notifications marked read");
    Ok(Json(serde_json::json!({ "data": { "marked_read": marked } })))
}

/// GET /api/notifications/{id}/attempts
///
/// Delivery attempts of one of the caller's notifications. Another user's
/// notification is reported as not found.
pub async fn list_attempts(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<DbId>,
) -> AppResult<Json<serde_json::Value>> {
    let record = state
        .engine
        .store
        .find_record(notification_id)
        .await?
        .filter(|r| r.user_id == auth.user_id)
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Notification",
            id: notification_id,
        }))?;

    let attempts = state.engine.store.list_attempts(record.id).await?;

    Ok(Json(serde_json::json!({ "data": attempts })))
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// GET /api/notifications/preferences
///
/// Stored preferences, or the platform defaults for a user who never saved
/// any.
pub async fn get_preferences(
    auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<serde_json::Value>> {
    let prefs = load_preferences(&state, auth.user_id).await?;

    Ok(Json(serde_json::json!({ "data": prefs })))
}

/// PUT /api/notifications/preferences
///
/// Apply a partial update and drop the cached resolution so the next event
/// sees it.
pub async fn update_preferences(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(input): Json<UpdatePreferences>,
) -> AppResult<Json<serde_json::Value>> {
    input.validate()?;

    let mut prefs = load_preferences(&state, auth.user_id).await?;
    prefs.apply(&input)?;
    let saved = state.engine.store.save_preferences(&prefs).await?;
    state.engine.resolver.invalidate(auth.user_id).await;

    tracing::info!(user_id = auth.user_id, "Notification preferences updated");
    Ok(Json(serde_json::json!({ "data": saved })))
}

async fn load_preferences(state: &AppState, user_id: DbId) -> AppResult<UserPreference> {
    Ok(state
        .engine
        .store
        .find_preferences(user_id)
        .await?
        .unwrap_or_else(|| UserPreference::defaults(user_id)))
}
