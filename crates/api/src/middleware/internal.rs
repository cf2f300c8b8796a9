//! Service-to-service authentication for event producers and provider
//! callbacks.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use pitchey_core::error::CoreError;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the shared internal token.
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// A caller that presented the shared `X-Internal-Token`.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing X-Internal-Token header".into(),
                ))
            })?;

        if !constant_time_eq(presented.as_bytes(), state.config.internal_token.as_bytes()) {
            return Err(AppError::Core(CoreError::Unauthorized(
                "Invalid internal token".into(),
            )));
        }
        Ok(InternalCaller)
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
