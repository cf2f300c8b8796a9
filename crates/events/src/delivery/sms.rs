//! SMS delivery through an HTTP gateway.
//!
//! The gateway accepts `POST <SMS_GATEWAY_URL>` with a JSON body
//! `{"to", "body", "reference"}` and answers with `{"id"}` on success.

use std::sync::LazyLock;

use async_trait::async_trait;
use pitchey_core::channels::Channel;
use regex::Regex;

use super::{classify_status, provider_ref, ChannelSender, OutboundMessage, SendError, SendReceipt};

/// E.164: a plus sign and 7 to 15 digits, no leading zero.
static E164_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("valid regex"));

/// Gateway statuses that mean the number itself was rejected.
const INVALID_RECIPIENT_STATUSES: [u16; 3] = [400, 404, 422];

/// Longest SMS body sent; longer text is truncated.
const MAX_SMS_CHARS: usize = 480;

pub fn is_e164(number: &str) -> bool {
    E164_RE.is_match(number)
}

pub struct SmsSender {
    client: reqwest::Client,
    gateway_url: String,
}

impl SmsSender {
    pub fn new(client: reqwest::Client, gateway_url: impl Into<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
        }
    }
}

fn sms_text(message: &OutboundMessage) -> String {
    let text = if message.body.is_empty() {
        message.title.clone()
    } else {
        format!("{}: {}", message.title, message.body)
    };
    text.chars().take(MAX_SMS_CHARS).collect()
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let to = message.require_recipient()?;
        if !is_e164(to) {
            return Err(SendError::InvalidRecipient(format!(
                "phone number is not E.164: {to}"
            )));
        }

        let response = self
            .client
            .post(&self.gateway_url)
            .json(&serde_json::json!({
                "to": to,
                "body": sms_text(message),
                "reference": message.attempt_id.to_string(),
            }))
            .send()
            .await?;
        classify_status(response.status(), &INVALID_RECIPIENT_STATUSES)?;

        let provider_ref = provider_ref(response, format!("sms:{}", message.attempt_id)).await;
        tracing::debug!(attempt_id = message.attempt_id, %provider_ref, "SMS accepted by gateway");
        Ok(SendReceipt { provider_ref })
    }
}
