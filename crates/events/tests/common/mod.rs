//! Shared harness for engine integration tests.
//!
//! Builds an [`Engine`] on the in-process store and rate limit backends,
//! with scripted senders for every external channel and a fan-out that
//! records what it pushed. Send jobs are not consumed by background
//! workers; tests call [`Harness::drain`] to deliver what is queued.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pitchey_core::channels::Channel;
use pitchey_core::event::{EventType, NotificationEvent};
use pitchey_core::types::DbId;
use pitchey_db::models::notification::{DeliveryAttempt, NotificationRecord};
use pitchey_db::models::preference::UserPreference;
use pitchey_events::delivery::in_app::InAppSender;
use pitchey_events::delivery::{OutboundMessage, SendReceipt};
use pitchey_events::preferences::PreferenceSource;
use pitchey_events::rate_limit::MemoryRateLimitStore;
use pitchey_events::store::MemoryStore;
use pitchey_events::{
    ChannelSender, Engine, EngineConfig, NotificationStore, NotifyOutcome, RealtimeFanout,
    SendError, SendJob, SenderRegistry,
};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Scripted sender
// ---------------------------------------------------------------------------

/// How a [`ScriptedSender`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Accept,
    Transport,
    InvalidRecipient,
}

/// Sender that answers according to its script and keeps every message.
pub struct ScriptedSender {
    channel: Channel,
    script: Mutex<Script>,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(Script::Accept),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    /// Messages this sender was asked to deliver, in order.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

/// Provider reference a [`ScriptedSender`] returns for an attempt.
pub fn provider_ref(channel: Channel, attempt_id: DbId) -> String {
    format!("{channel}-{attempt_id}")
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        self.sent.lock().unwrap().push(message.clone());
        let script = *self.script.lock().unwrap();
        match script {
            Script::Accept => Ok(SendReceipt {
                provider_ref: provider_ref(self.channel, message.attempt_id),
            }),
            Script::Transport => Err(SendError::Transport("gateway returned 503".into())),
            Script::InvalidRecipient => {
                Err(SendError::InvalidRecipient("unknown recipient".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording fan-out
// ---------------------------------------------------------------------------

/// Records `(user_id, notification_id)` for every realtime push.
#[derive(Default)]
pub struct RecordingFanout {
    pushed: Mutex<Vec<(DbId, DbId)>>,
}

impl RecordingFanout {
    pub fn pushed(&self) -> Vec<(DbId, DbId)> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeFanout for RecordingFanout {
    async fn push(&self, user_id: DbId, record: &NotificationRecord) -> usize {
        self.pushed.lock().unwrap().push((user_id, record.id));
        1
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Configuration with short timeouts suitable for tests.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        enqueue_timeout: Duration::from_millis(50),
        rate_limit_timeout: Duration::from_millis(500),
        preference_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_secs(1),
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub rx: mpsc::Receiver<SendJob>,
    pub store: Arc<MemoryStore>,
    pub fanout: Arc<RecordingFanout>,
    senders: HashMap<Channel, Arc<ScriptedSender>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Harness whose preferences come from `source` instead of the store.
    pub fn with_source(config: EngineConfig, source: Arc<dyn PreferenceSource>) -> Self {
        Self::build(config, Some(source))
    }

    fn build(config: EngineConfig, source: Option<Arc<dyn PreferenceSource>>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fanout = Arc::new(RecordingFanout::default());

        let mut registry = SenderRegistry::new().with(Arc::new(InAppSender));
        let mut senders = HashMap::new();
        for channel in [Channel::Email, Channel::Sms, Channel::Push, Channel::Webhook] {
            let sender = Arc::new(ScriptedSender::new(channel));
            registry.register(sender.clone());
            senders.insert(channel, sender);
        }

        let dyn_store: Arc<dyn NotificationStore> = store.clone();
        let rate_store = Arc::new(MemoryRateLimitStore::new());
        let (engine, rx) = match source {
            Some(source) => Engine::build_with_source(
                config,
                dyn_store,
                source,
                rate_store,
                registry,
                fanout.clone(),
            ),
            None => Engine::build(config, dyn_store, rate_store, registry, fanout.clone()),
        };

        Self {
            engine,
            rx,
            store,
            fanout,
            senders,
        }
    }

    pub fn sender(&self, channel: Channel) -> &ScriptedSender {
        &self.senders[&channel]
    }

    /// Store preferences for `user_id`, starting from the defaults.
    pub async fn set_prefs(&self, user_id: DbId, edit: impl FnOnce(&mut UserPreference)) {
        let mut prefs = UserPreference::defaults(user_id);
        edit(&mut prefs);
        self.store.save_preferences(&prefs).await.unwrap();
        self.engine.resolver.invalidate(user_id).await;
    }

    pub async fn notify(&self, event_id: &str, user_id: DbId, event_type: EventType) -> NotifyOutcome {
        self.engine
            .dispatcher
            .notify(NotificationEvent::new(event_id, user_id, event_type))
            .await
            .unwrap()
    }

    /// Deliver every queued job and return the updated attempts.
    pub async fn drain(&mut self) -> Vec<DeliveryAttempt> {
        let mut delivered = Vec::new();
        while let Ok(job) = self.rx.try_recv() {
            if let Some(attempt) = self.engine.dispatcher.deliver(job).await.unwrap() {
                delivered.push(attempt);
            }
        }
        delivered
    }

    pub async fn attempt(&self, id: DbId) -> DeliveryAttempt {
        self.store.find_attempt(id).await.unwrap().unwrap()
    }
}
