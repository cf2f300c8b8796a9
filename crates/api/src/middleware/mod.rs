//! Authentication and authorization extractors.
//!
//! - [`auth::AuthUser`] -- Extracts the authenticated user from a JWT Bearer token.
//! - [`rbac::RequireAdmin`] -- Requires the `admin` role.
//! - [`internal::InternalCaller`] -- Requires the shared `X-Internal-Token`.

pub mod auth;
pub mod internal;
pub mod rbac;
