use std::sync::Arc;

use pitchey_events::Engine;

use crate::config::ServerConfig;
use crate::ws::RoomRegistry;

/// Shared application state available to all handlers via Axum's `State` extractor.
///
/// Cheap to clone: every field is an `Arc` or a handle of `Arc`s.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (JWT secret, internal token, timeouts).
    pub config: Arc<ServerConfig>,
    /// The notification delivery engine.
    pub engine: Engine,
    /// Per-user WebSocket rooms for realtime in-app delivery.
    pub rooms: Arc<RoomRegistry>,
}
