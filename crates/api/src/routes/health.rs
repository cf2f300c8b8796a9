use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Notification store backend (`postgres` or `memory`).
    pub store: &'static str,
    /// Whether the notification store is reachable.
    pub store_healthy: bool,
    /// Whether the rate limit counters are reachable.
    pub rate_limit_healthy: bool,
    /// Live subscribed WebSocket connections.
    pub connections: usize,
}

/// GET /health -- returns service, store and rate limiter health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_healthy = state.engine.store.health_check().await.is_ok();
    let rate_limit_healthy = state.engine.limiter.store().health_check().await.is_ok();

    // Rate limiting fails open, so only the store decides degradation.
    let status = if store_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store: state.engine.store.backend(),
        store_healthy,
        rate_limit_healthy,
        connections: state.rooms.connection_count(),
    })
}

/// Mount health check routes at the root.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
