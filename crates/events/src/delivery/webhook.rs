//! Webhook delivery to user-registered endpoints.
//!
//! [`WebhookSender`] POSTs a JSON description of the notification to the
//! user's `webhookUrl`. When a signing secret is configured the raw body is
//! signed with HMAC-SHA256 and the hex digest sent as
//! `X-Pitchey-Signature: sha256=<hex>`. A single attempt is made per call;
//! failed attempts are rescheduled by the retry worker.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use pitchey_core::channels::Channel;
use reqwest::Url;
use sha2::Sha256;

use super::{classify_status, provider_ref, ChannelSender, OutboundMessage, SendError, SendReceipt};

pub const SIGNATURE_HEADER: &str = "X-Pitchey-Signature";

/// 410 Gone means the endpoint was removed on purpose.
const INVALID_RECIPIENT_STATUSES: [u16; 1] = [410];

type HmacSha256 = Hmac<Sha256>;

/// Compute the `sha256=<hex>` signature of a webhook body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

/// Parse a webhook URL, accepting only http and https.
pub fn parse_endpoint(raw: &str) -> Result<Url, SendError> {
    let url = Url::parse(raw)
        .map_err(|e| SendError::InvalidRecipient(format!("malformed webhook URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SendError::InvalidRecipient(format!(
            "unsupported webhook scheme: {other}"
        ))),
    }
}

pub struct WebhookSender {
    client: reqwest::Client,
    signing_secret: Option<String>,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, signing_secret: Option<String>) -> Self {
        Self {
            client,
            signing_secret,
        }
    }
}

fn webhook_body(message: &OutboundMessage) -> serde_json::Value {
    serde_json::json!({
        "notificationId": message.notification_id,
        "attemptId": message.attempt_id,
        "userId": message.user_id,
        "eventType": message.event_type,
        "title": message.title,
        "body": message.body,
        "payload": message.payload,
    })
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let url = parse_endpoint(message.require_recipient()?)?;
        let body = serde_json::to_vec(&webhook_body(message))
            .map_err(|e| SendError::Transport(format!("webhook body encoding failed: {e}")))?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        let response = request.body(body).send().await?;
        if let Err(e) = classify_status(response.status(), &INVALID_RECIPIENT_STATUSES) {
            tracing::warn!(
                attempt_id = message.attempt_id,
                user_id = message.user_id,
                error = %e,
                "Webhook delivery attempt failed"
            );
            return Err(e);
        }

        let provider_ref = provider_ref(response, format!("webhook:{}", message.attempt_id)).await;
        Ok(SendReceipt { provider_ref })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
