//! Route definitions for the `/api/notifications` resource.
//!
//! All endpoints require authentication; metrics require the admin role.

use axum::routing::{get, put};
use axum::Router;

use crate::handlers::{dashboard, notification};
use crate::state::AppState;

/// Routes mounted at `/api/notifications`.
///
/// ```text
/// GET    /unread                        -> list_unread
/// GET    /unread-count                  -> unread_count
/// PUT    /mark-read                     -> mark_read
/// GET    /{id}/attempts                 -> list_attempts
///
/// GET    /preferences                   -> get_preferences
/// PUT    /preferences                   -> update_preferences
///
/// GET    /dashboard/metrics/{metric}    -> get_metric (admin)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        // Inbox
        .route("/unread", get(notification::list_unread))
        .route("/unread-count", get(notification::unread_count))
        .route("/mark-read", put(notification::mark_read))
        .route("/{id}/attempts", get(notification::list_attempts))
        // Preferences
        .route(
            "/preferences",
            get(notification::get_preferences).put(notification::update_preferences),
        )
        // Dashboard
        .route("/dashboard/metrics/{metric}", get(dashboard::get_metric))
}
