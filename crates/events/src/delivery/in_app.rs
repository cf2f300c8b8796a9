//! In-app delivery: the stored record is the inbox entry, so sending only
//! acknowledges it. Realtime push happens after the attempt is marked sent.

use async_trait::async_trait;
use pitchey_core::channels::Channel;

use super::{ChannelSender, OutboundMessage, SendError, SendReceipt};

pub struct InAppSender;

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        Ok(SendReceipt {
            provider_ref: format!("inbox:{}", message.notification_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitchey_core::event::EventType;

    #[tokio::test]
    async fn provider_ref_points_at_the_inbox_entry() {
        let message = OutboundMessage {
            attempt_id: 9,
            notification_id: 77,
            user_id: 42,
            channel: Channel::InApp,
            recipient: None,
            event_type: EventType::Follow,
            title: "New follower".into(),
            body: String::new(),
            payload: serde_json::json!({}),
        };
        let receipt = InAppSender.send(&message).await.unwrap();
        assert_eq!(receipt.provider_ref, "inbox:77");
    }
}
