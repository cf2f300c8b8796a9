//! Inbound notification events.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

/// Maximum accepted length of a producer-supplied event id.
pub const MAX_EVENT_ID_LEN: usize = 200;

/// Prefix of event ids the digest batcher assigns to digest records.
pub const DIGEST_EVENT_PREFIX: &str = "digest:";

/// Kind of domain event that triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NdaRequest,
    Message,
    Follow,
    PitchView,
    InvestmentUpdate,
    System,
    /// Aggregated digest email produced by the digest batcher.
    Digest,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NdaRequest => "nda_request",
            EventType::Message => "message",
            EventType::Follow => "follow",
            EventType::PitchView => "pitch_view",
            EventType::InvestmentUpdate => "investment_update",
            EventType::System => "system",
            EventType::Digest => "digest",
        }
    }

    /// Security-relevant events (NDA decisions, account alerts) always
    /// reach at least in-app and email, whatever the user's preferences.
    pub fn is_security_relevant(self) -> bool {
        matches!(self, EventType::NdaRequest | EventType::System)
    }

    /// Plural label used for digest section headings.
    pub fn digest_heading(self) -> &'static str {
        match self {
            EventType::NdaRequest => "NDA requests",
            EventType::Message => "Messages",
            EventType::Follow => "New followers",
            EventType::PitchView => "Pitch views",
            EventType::InvestmentUpdate => "Investment updates",
            EventType::System => "System notices",
            EventType::Digest => "Digests",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nda_request" => Ok(EventType::NdaRequest),
            "message" => Ok(EventType::Message),
            "follow" => Ok(EventType::Follow),
            "pitch_view" => Ok(EventType::PitchView),
            "investment_update" => Ok(EventType::InvestmentUpdate),
            "system" => Ok(EventType::System),
            "digest" => Ok(EventType::Digest),
            other => Err(CoreError::Validation(format!("Unknown event type: {other}"))),
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The inbound trigger handed to the dispatcher by an event producer.
///
/// Immutable once created; `event_id` is the producer's idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub user_id: DbId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

impl NotificationEvent {
    /// Create an event with an empty object payload.
    pub fn new(event_id: impl Into<String>, user_id: DbId, event_type: EventType) -> Self {
        Self {
            event_id: event_id.into(),
            user_id,
            event_type,
            payload: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    /// Set the JSON payload used to render content.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Check the producer-supplied fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.event_id.trim().is_empty() {
            return Err(CoreError::Validation("eventId must not be empty".into()));
        }
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(CoreError::Validation(format!(
                "eventId must be at most {MAX_EVENT_ID_LEN} characters"
            )));
        }
        if self.event_id.starts_with(DIGEST_EVENT_PREFIX) {
            return Err(CoreError::Validation(format!(
                "eventId must not start with reserved prefix '{DIGEST_EVENT_PREFIX}'"
            )));
        }
        if self.event_type == EventType::Digest {
            return Err(CoreError::Validation(
                "digest events are produced internally".into(),
            ));
        }
        if !self.payload.is_object() {
            return Err(CoreError::Validation("payload must be a JSON object".into()));
        }
        Ok(())
    }
}
