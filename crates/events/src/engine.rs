//! Wiring of the delivery engine.
//!
//! [`Engine::build`] creates every component from an [`EngineConfig`] and
//! the chosen backends; [`Engine::start`] spawns the send workers, the
//! retry worker and the digest scheduler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::delivery::SenderRegistry;
use crate::digest::DigestScheduler;
use crate::dispatcher::{DispatchWorkers, Dispatcher};
use crate::experiments::ExperimentRegistry;
use crate::fanout::RealtimeFanout;
use crate::preferences::{PreferenceResolver, PreferenceSource, StorePreferenceSource};
use crate::queue::{SendJob, SendQueue};
use crate::rate_limit::{RateLimitStore, RateLimiter};
use crate::retry::RetryWorker;
use crate::store::NotificationStore;
use crate::tracker::DeliveryTracker;

/// All engine components, shared behind `Arc`s.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn NotificationStore>,
    pub resolver: Arc<PreferenceResolver>,
    pub limiter: Arc<RateLimiter>,
    pub tracker: Arc<DeliveryTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub digest: Arc<DigestScheduler>,
    pub retry: Arc<RetryWorker>,
    pub queue: SendQueue,
}

impl Engine {
    /// Build the engine with preferences read from `store`. The returned
    /// receiver is the consuming end of the send queue and must be passed
    /// to [`Engine::start`].
    pub fn build(
        config: EngineConfig,
        store: Arc<dyn NotificationStore>,
        rate_store: Arc<dyn RateLimitStore>,
        senders: SenderRegistry,
        fanout: Arc<dyn RealtimeFanout>,
    ) -> (Self, mpsc::Receiver<SendJob>) {
        let source = Arc::new(StorePreferenceSource::new(Arc::clone(&store)));
        Self::build_with_source(config, store, source, rate_store, senders, fanout)
    }

    /// Build the engine with a separate preference source.
    pub fn build_with_source(
        config: EngineConfig,
        store: Arc<dyn NotificationStore>,
        preferences: Arc<dyn PreferenceSource>,
        rate_store: Arc<dyn RateLimitStore>,
        senders: SenderRegistry,
        fanout: Arc<dyn RealtimeFanout>,
    ) -> (Self, mpsc::Receiver<SendJob>) {
        let (queue, rx) = SendQueue::bounded(config.queue_capacity, config.enqueue_timeout);

        let resolver = Arc::new(PreferenceResolver::new(
            preferences,
            config.preference_cache_ttl,
            config.preference_timeout,
        ));
        let limiter = Arc::new(RateLimiter::new(
            rate_store,
            config.policies.clone(),
            config.rate_limit_timeout,
        ));
        let tracker = Arc::new(DeliveryTracker::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            config.retry.clone(),
        ));
        let experiments = Arc::new(ExperimentRegistry::from_experiments(
            config.experiments.iter().cloned(),
        ));

        let dispatcher = Arc::new(Dispatcher {
            store: Arc::clone(&store),
            resolver: Arc::clone(&resolver),
            limiter: Arc::clone(&limiter),
            experiments,
            senders: senders.clone(),
            tracker: Arc::clone(&tracker),
            fanout,
            queue: queue.clone(),
            policies: config.policies.clone(),
            send_timeout: config.send_timeout,
            in_flight: Mutex::new(HashSet::new()),
        });

        let digest = Arc::new(DigestScheduler::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            senders.clone(),
            queue.clone(),
            config.batch_size,
            config.digest_interval,
        ));
        let retry = Arc::new(RetryWorker::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            queue.clone(),
            config.batch_size,
            config.retry_interval,
            config.pending_sweep_after,
        ));

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            channels = ?senders.channels(),
            store = store.backend(),
            rate_limit_store = limiter.store().backend(),
            "Notification engine built"
        );

        let engine = Self {
            config: Arc::new(config),
            store,
            resolver,
            limiter,
            tracker,
            dispatcher,
            digest,
            retry,
            queue,
        };
        (engine, rx)
    }

    /// Spawn the send workers and the periodic services. All of them stop
    /// when `cancel` fires.
    pub fn start(
        &self,
        rx: mpsc::Receiver<SendJob>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = DispatchWorkers::spawn(
            Arc::clone(&self.dispatcher),
            rx,
            self.config.worker_count,
            cancel.clone(),
        );

        let retry = Arc::clone(&self.retry);
        let retry_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            retry.run(retry_cancel).await;
        }));

        let digest = Arc::clone(&self.digest);
        handles.push(tokio::spawn(async move {
            digest.run(cancel).await;
        }));

        handles
    }
}
