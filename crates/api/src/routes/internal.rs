//! Route definitions for service-to-service endpoints.
//!
//! Every endpoint requires the shared `X-Internal-Token`.

use axum::routing::post;
use axum::Router;

use crate::handlers::ingest;
use crate::state::AppState;

/// Routes mounted at `/internal`.
///
/// ```text
/// POST   /notifications                        -> ingest_event
/// POST   /notifications/callbacks/{channel}    -> provider_callback
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", post(ingest::ingest_event))
        .route(
            "/notifications/callbacks/{channel}",
            post(ingest::provider_callback),
        )
}
