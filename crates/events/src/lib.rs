//! Pitchey notification delivery engine.
//!
//! Turns domain events into delivered notifications:
//!
//! - [`Dispatcher`] runs idempotency, preference resolution, rate limiting,
//!   variant assignment and rendering, persists the record and hands send
//!   jobs to the worker pool.
//! - [`RateLimiter`] enforces hourly and burst windows per user and channel
//!   against a [`RateLimitStore`] (Redis or in-process).
//! - [`PreferenceResolver`] turns stored preferences into effective channels.
//! - [`delivery`] holds the channel senders (in-app, email, SMS, push,
//!   webhook).
//! - [`DeliveryTracker`] is the single funnel for attempt state changes.
//! - [`RetryWorker`] and [`DigestScheduler`] are the periodic background
//!   services.
//! - [`Engine`] wires everything together from an [`EngineConfig`].

pub mod config;
pub mod delivery;
pub mod digest;
pub mod dispatcher;
pub mod engine;
pub mod experiments;
pub mod fanout;
pub mod metrics;
pub mod preferences;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod tracker;

pub use config::{ChannelPolicies, EngineConfig};
pub use delivery::email::{EmailConfig, EmailSender};
pub use delivery::{ChannelSender, SendError, SenderRegistry};
pub use digest::DigestScheduler;
pub use dispatcher::{DispatchError, DispatchWorkers, Dispatcher, NotifyOutcome};
pub use engine::Engine;
pub use experiments::ExperimentRegistry;
pub use fanout::{NoopFanout, RealtimeFanout};
pub use preferences::{PreferenceResolver, PreferenceSource};
pub use queue::{SendJob, SendQueue};
pub use rate_limit::{RateLimitStore, RateLimiter};
pub use retry::RetryWorker;
pub use store::{NotificationStore, StoreError};
pub use tracker::{DeliveryTracker, TrackerError};
