//! Background tasks and scheduled jobs owned by the HTTP server.
//!
//! Each submodule provides a long-running async function intended to be
//! spawned via `tokio::spawn`. All tasks accept a [`CancellationToken`]
//! for graceful shutdown. The engine's own loops (send workers, retries,
//! digests) are started by `Engine::start`.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod rate_limit_reaper;
