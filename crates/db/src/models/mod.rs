//! Row models and DTOs.
//!
//! Each submodule contains:
//! - `FromRow` + `Serialize` entity structs matching database rows
//! - insert DTOs consumed by the repositories
//! - `Deserialize` update DTOs (all `Option` fields) for patches

pub mod digest;
pub mod notification;
pub mod preference;
