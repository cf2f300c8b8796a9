//! Notification delivery channels.
//!
//! The string form of each [`Channel`] is what is stored in the
//! `delivery_attempts.channel` column, embedded in rate-limit keys and
//! accepted in provider callback URLs, so it must stay stable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// In-app inbox entry plus realtime WebSocket push.
pub const CHANNEL_IN_APP: &str = "in_app";

/// Email delivered via SMTP.
pub const CHANNEL_EMAIL: &str = "email";

/// SMS delivered via the SMS gateway.
pub const CHANNEL_SMS: &str = "sms";

/// Mobile push delivered via the push gateway.
pub const CHANNEL_PUSH: &str = "push";

/// Webhook POST to a user-registered endpoint.
pub const CHANNEL_WEBHOOK: &str = "webhook";

/// A delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Sms,
    Push,
    Webhook,
}

impl Channel {
    /// Every channel, in dispatch order.
    pub const ALL: [Channel; 5] = [
        Channel::InApp,
        Channel::Email,
        Channel::Sms,
        Channel::Push,
        Channel::Webhook,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::InApp => CHANNEL_IN_APP,
            Channel::Email => CHANNEL_EMAIL,
            Channel::Sms => CHANNEL_SMS,
            Channel::Push => CHANNEL_PUSH,
            Channel::Webhook => CHANNEL_WEBHOOK,
        }
    }

    /// Upper-case name used in environment variable keys (`NOTIFY_EMAIL_...`).
    pub fn env_key(self) -> &'static str {
        match self {
            Channel::InApp => "IN_APP",
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::Webhook => "WEBHOOK",
        }
    }

    /// Channels that interrupt the user and are therefore silenced by
    /// do-not-disturb.
    pub fn is_interruptive(self) -> bool {
        matches!(self, Channel::Sms | Channel::Push)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CHANNEL_IN_APP => Ok(Channel::InApp),
            CHANNEL_EMAIL => Ok(Channel::Email),
            CHANNEL_SMS => Ok(Channel::Sms),
            CHANNEL_PUSH => Ok(Channel::Push),
            CHANNEL_WEBHOOK => Ok(Channel::Webhook),
            other => Err(CoreError::Validation(format!("Unknown channel: {other}"))),
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_round_trips_for_every_channel() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Channel::InApp).unwrap();
        assert_eq!(json, "\"in_app\"");
    }

    #[test]
    fn unknown_channel_is_rejected() {
        assert!("carrier_pigeon".parse::<Channel>().is_err());
    }

    #[test]
    fn only_sms_and_push_are_interruptive() {
        let interruptive: Vec<_> = Channel::ALL
            .into_iter()
            .filter(|c| c.is_interruptive())
            .collect();
        assert_eq!(interruptive, vec![Channel::Sms, Channel::Push]);
    }
}
