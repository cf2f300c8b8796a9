//! Channel senders.
//!
//! Every channel implements [`ChannelSender`]: one message in, a provider
//! reference or a classified [`SendError`] out. Senders never retry
//! internally; retry scheduling belongs to the delivery tracker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pitchey_core::channels::Channel;
use pitchey_core::event::EventType;
use pitchey_core::types::DbId;
use reqwest::StatusCode;

use crate::config::EngineConfig;

pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;
pub mod webhook;

/// HTTP request timeout for gateway and webhook calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A rendered notification addressed to one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub attempt_id: DbId,
    pub notification_id: DbId,
    pub user_id: DbId,
    pub channel: Channel,
    /// Address, phone number, device token or URL. `None` for in-app.
    pub recipient: Option<String>,
    pub event_type: EventType,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    /// The recipient, or [`SendError::InvalidRecipient`] if there is none.
    pub fn require_recipient(&self) -> Result<&str, SendError> {
        self.recipient
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| SendError::InvalidRecipient(format!("no {} recipient", self.channel)))
    }
}

/// Successful hand-off to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider message id, used to correlate delivery callbacks.
    pub provider_ref: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Network failure, timeout, throttling or provider-side error.
    /// Retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The recipient can never receive this channel. Terminal; the channel
    /// is suppressed for the user.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transport(_))
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        SendError::Transport(e.to_string())
    }
}

/// Delivers messages for one channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Senders by channel. Channels without a sender are never dispatched.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the production senders from configuration. In-app and webhook
    /// are always available; email, SMS and push only when configured.
    pub fn from_config(config: &EngineConfig, email: Option<email::EmailConfig>) -> Self {
        let client = http_client();
        let mut registry = Self::new().with(Arc::new(in_app::InAppSender));

        match email.map(email::EmailSender::new) {
            Some(Ok(sender)) => registry.register(Arc::new(sender)),
            Some(Err(e)) => tracing::error!(error = %e, "Email sender disabled: invalid SMTP configuration"),
            None => tracing::info!("SMTP_HOST not set, email channel disabled"),
        }
        match &config.sms_gateway_url {
            Some(url) => registry.register(Arc::new(sms::SmsSender::new(client.clone(), url))),
            None => tracing::info!("SMS_GATEWAY_URL not set, SMS channel disabled"),
        }
        match &config.push_gateway_url {
            Some(url) => registry.register(Arc::new(push::PushSender::new(client.clone(), url))),
            None => tracing::info!("PUSH_GATEWAY_URL not set, push channel disabled"),
        }
        registry.register(Arc::new(webhook::WebhookSender::new(
            client,
            config.webhook_signing_secret.clone(),
        )));
        registry
    }

    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(sender);
        self
    }

    /// Add or replace the sender for its channel.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(sender.channel(), sender);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    /// Registered channels in dispatch order.
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.contains(*c))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Shared client for the gateway and webhook senders.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .expect("Failed to build reqwest HTTP client")
}

/// Classify a provider response status. `invalid` lists the statuses that
/// mean the recipient itself is unusable.
pub(crate) fn classify_status(status: StatusCode, invalid: &[u16]) -> Result<(), SendError> {
    if status.is_success() {
        return Ok(());
    }
    if invalid.contains(&status.as_u16()) {
        return Err(SendError::InvalidRecipient(format!(
            "provider rejected recipient (HTTP {})",
            status.as_u16()
        )));
    }
    Err(SendError::Transport(format!(
        "provider returned HTTP {}",
        status.as_u16()
    )))
}

/// Read the provider's message id (`id` or `messageId`) from a JSON
/// response body, falling back to `fallback`.
pub(crate) async fn provider_ref(response: reqwest::Response, fallback: String) -> String {
    let body: Option<serde_json::Value> = response.json().await.ok();
    body.as_ref()
        .and_then(|v| v.get("id").or_else(|| v.get("messageId")))
        .and_then(|id| match id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or(fallback)
}
