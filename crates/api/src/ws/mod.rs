//! WebSocket infrastructure for realtime in-app delivery.
//!
//! Provides the per-user room registry, heartbeat pings, and the HTTP
//! upgrade handler used by Axum routes.

mod handler;
mod heartbeat;
pub mod registry;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use registry::RoomRegistry;
