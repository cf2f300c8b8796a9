use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pitchey_core::error::CoreError;
use pitchey_events::{DispatchError, StoreError, TrackerError};
use serde_json::json;

/// Seconds a producer is asked to wait after a full send queue.
pub const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and the engine's error types, and
/// adds HTTP-specific variants. Implements [`IntoResponse`] to produce
/// consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `pitchey_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A persistence error from the notification store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A delivery tracker rejection.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The engine cannot accept work right now.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        retry_after_secs: u64,
    },

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(core) => AppError::Core(core),
            DispatchError::QueueFull => AppError::ServiceUnavailable {
                message: "Send queue is full, retry later".into(),
                retry_after_secs: QUEUE_FULL_RETRY_AFTER_SECS,
            },
            DispatchError::Closed => AppError::ServiceUnavailable {
                message: "Notification engine is shutting down".into(),
                retry_after_secs: QUEUE_FULL_RETRY_AFTER_SECS,
            },
            DispatchError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Core(CoreError::Validation(errors.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Engine errors ---
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                internal()
            }
            AppError::Tracker(err) => match err {
                TrackerError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
                TrackerError::Terminal(_)
                | TrackerError::InvalidTransition(_)
                | TrackerError::Conflict(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", err.to_string())
                }
                TrackerError::Store(store) => {
                    tracing::error!(error = %store, "Store error");
                    internal()
                }
            },
            AppError::ServiceUnavailable { message, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                message.clone(),
            ),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let AppError::ServiceUnavailable {
            retry_after_secs, ..
        } = &self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
