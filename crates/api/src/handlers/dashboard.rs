//! Admin delivery dashboard.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use pitchey_events::metrics::{self, Metric, TimeRange};
use serde::Deserialize;

use crate::error::AppResult;
use crate::middleware::rbac::RequireAdmin;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    /// `1h`, `24h`, `7d` or `30d`. Defaults to `24h`.
    pub time_range: Option<String>,
}

/// GET /api/notifications/dashboard/metrics/{metric}
pub async fn get_metric(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState>,
    Path(metric): Path<String>,
    Query(params): Query<MetricsQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let metric: Metric = metric.parse()?;
    let range = match params.time_range.as_deref() {
        Some(raw) => raw.parse::<TimeRange>()?,
        None => TimeRange::default(),
    };

    let report = metrics::report(state.engine.store.as_ref(), metric, range, Utc::now()).await?;

    Ok(Json(serde_json::json!({ "data": report })))
}
