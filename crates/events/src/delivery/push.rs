//! Mobile push through an HTTP gateway.
//!
//! `POST <PUSH_GATEWAY_URL>` with `{"token", "title", "body", "data"}`.
//! 404 and 410 mean the device token is no longer registered.

use async_trait::async_trait;
use pitchey_core::channels::Channel;

use super::{classify_status, provider_ref, ChannelSender, OutboundMessage, SendError, SendReceipt};

const INVALID_RECIPIENT_STATUSES: [u16; 2] = [404, 410];

pub struct PushSender {
    client: reqwest::Client,
    gateway_url: String,
}

impl PushSender {
    pub fn new(client: reqwest::Client, gateway_url: impl Into<String>) -> Self {
        Self {
            client,
            gateway_url: gateway_url.into(),
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let token = message.require_recipient()?;
        let response = self
            .client
            .post(&self.gateway_url)
            .json(&serde_json::json!({
                "token": token,
                "title": message.title,
                "body": message.body,
                "data": {
                    "notificationId": message.notification_id,
                    "eventType": message.event_type,
                },
            }))
            .send()
            .await?;
        classify_status(response.status(), &INVALID_RECIPIENT_STATUSES)?;

        let provider_ref = provider_ref(response, format!("push:{}", message.attempt_id)).await;
        Ok(SendReceipt { provider_ref })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pitchey_core::event::EventType;

    #[tokio::test]
    async fn missing_token_is_invalid_recipient() {
        let sender = PushSender::new(reqwest::Client::new(), "http://127.0.0.1:9/push");
        let message = OutboundMessage {
            attempt_id: 3,
            notification_id: 4,
            user_id: 5,
            channel: Channel::Push,
            recipient: None,
            event_type: EventType::Follow,
            title: "New follower".into(),
            body: String::new(),
            payload: serde_json::json!({}),
        };
        assert_matches!(sender.send(&message).await, Err(SendError::InvalidRecipient(_)));
    }
}
