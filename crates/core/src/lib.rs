//! Domain vocabulary shared by every Pitchey notification crate.
//!
//! This crate has zero internal dependencies so the engine, persistence
//! layer and HTTP server can all agree on channels, event types, the
//! delivery state machine and the time-window math without pulling in
//! I/O.

pub mod channels;
pub mod delivery;
pub mod digest;
pub mod error;
pub mod event;
pub mod experiment;
pub mod rate_limit;
pub mod render;
pub mod retry;
pub mod roles;
pub mod types;
