//! User notification preference and channel suppression models.

use chrono::NaiveTime;
use pitchey_core::channels::Channel;
use pitchey_core::digest::{parse_timezone, DigestFrequency, DEFAULT_DIGEST_TIME};
use pitchey_core::error::CoreError;
use pitchey_core::event::EventType;
use pitchey_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// A row from the `user_notification_preferences` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    pub user_id: DbId,
    pub in_app_enabled: bool,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub push_enabled: bool,
    pub webhook_enabled: bool,
    #[sqlx(try_from = "String")]
    pub digest_frequency: DigestFrequency,
    pub digest_time: NaiveTime,
    pub timezone: String,
    #[sqlx(json)]
    pub opted_out_event_types: Vec<EventType>,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub push_token: Option<String>,
    pub webhook_url: Option<String>,
    pub dnd_until: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl UserPreference {
    /// Platform defaults used when a user has never saved preferences:
    /// in-app and email, delivered instantly.
    pub fn defaults(user_id: DbId) -> Self {
        let (hour, minute) = DEFAULT_DIGEST_TIME;
        Self {
            user_id,
            in_app_enabled: true,
            email_enabled: true,
            sms_enabled: false,
            push_enabled: false,
            webhook_enabled: false,
            digest_frequency: DigestFrequency::Instant,
            digest_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN),
            timezone: "UTC".to_string(),
            opted_out_event_types: Vec::new(),
            email_address: None,
            phone_number: None,
            push_token: None,
            webhook_url: None,
            dnd_until: None,
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::InApp => self.in_app_enabled,
            Channel::Email => self.email_enabled,
            Channel::Sms => self.sms_enabled,
            Channel::Push => self.push_enabled,
            Channel::Webhook => self.webhook_enabled,
        }
    }

    /// The contact point a channel delivers to. In-app has none.
    pub fn recipient_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::InApp => None,
            Channel::Email => self.email_address.as_deref(),
            Channel::Sms => self.phone_number.as_deref(),
            Channel::Push => self.push_token.as_deref(),
            Channel::Webhook => self.webhook_url.as_deref(),
        }
    }

    pub fn is_opted_out(&self, event_type: EventType) -> bool {
        self.opted_out_event_types.contains(&event_type)
    }

    /// Apply a partial update, validating the fields that need parsing.
    pub fn apply(&mut self, update: &UpdatePreferences) -> Result<(), CoreError> {
        if let Some(v) = update.in_app_enabled {
            self.in_app_enabled = v;
        }
        if let Some(v) = update.email_enabled {
            self.email_enabled = v;
        }
        if let Some(v) = update.sms_enabled {
            self.sms_enabled = v;
        }
        if let Some(v) = update.push_enabled {
            self.push_enabled = v;
        }
        if let Some(v) = update.webhook_enabled {
            self.webhook_enabled = v;
        }
        if let Some(frequency) = update.digest_frequency {
            self.digest_frequency = frequency;
        }
        if let Some(time) = &update.digest_time {
            self.digest_time = parse_digest_time(time)?;
        }
        if let Some(tz) = &update.timezone {
            parse_timezone(tz)?;
            self.timezone = tz.trim().to_string();
        }
        if let Some(types) = &update.opted_out_event_types {
            let mut types = types.clone();
            types.sort();
            types.dedup();
            self.opted_out_event_types = types;
        }
        if let Some(v) = &update.email_address {
            self.email_address = non_empty(v);
        }
        if let Some(v) = &update.phone_number {
            self.phone_number = non_empty(v);
        }
        if let Some(v) = &update.push_token {
            self.push_token = non_empty(v);
        }
        if let Some(v) = &update.webhook_url {
            self.webhook_url = non_empty(v);
        }
        if let Some(dnd) = update.dnd_until {
            self.dnd_until = dnd;
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse a local time of day written as `HH:MM` or `HH:MM:SS`.
pub fn parse_digest_time(value: &str) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| CoreError::Validation(format!("Invalid digest time: {value}")))
}

/// DTO for updating preferences. Absent fields are left unchanged; an empty
/// string clears a contact point.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferences {
    pub in_app_enabled: Option<bool>,
    pub email_enabled: Option<bool>,
    pub sms_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub webhook_enabled: Option<bool>,
    pub digest_frequency: Option<DigestFrequency>,
    pub digest_time: Option<String>,
    pub timezone: Option<String>,
    pub opted_out_event_types: Option<Vec<EventType>>,
    #[validate(length(max = 320))]
    pub email_address: Option<String>,
    #[validate(length(max = 32))]
    pub phone_number: Option<String>,
    #[validate(length(max = 4096))]
    pub push_token: Option<String>,
    #[validate(length(max = 2048))]
    pub webhook_url: Option<String>,
    /// `null` clears do-not-disturb; omitting the field leaves it unchanged.
    #[serde(default, deserialize_with = "double_option")]
    pub dnd_until: Option<Option<Timestamp>>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<Timestamp>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Timestamp>::deserialize(deserializer).map(Some)
}

/// A row from the `channel_suppressions` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct ChannelSuppression {
    pub user_id: DbId,
    #[sqlx(try_from = "String")]
    pub channel: Channel,
    pub reason: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_in_app_and_email_only() {
        let prefs = UserPreference::defaults(1);
        let enabled: Vec<Channel> = Channel::ALL
            .into_iter()
            .filter(|c| prefs.channel_enabled(*c))
            .collect();
        assert_eq!(enabled, vec![Channel::InApp, Channel::Email]);
        assert_eq!(prefs.digest_frequency, DigestFrequency::Instant);
    }

    #[test]
    fn apply_updates_only_present_fields() {
        let mut prefs = UserPreference::defaults(1);
        let update: UpdatePreferences = serde_json::from_value(serde_json::json!({
            "smsEnabled": true,
            "phoneNumber": "+15550001111",
            "digestFrequency": "weekly",
            "digestTime": "18:30",
            "timezone": "-05:00"
        }))
        .unwrap();
        prefs.apply(&update).unwrap();
        assert!(prefs.sms_enabled);
        assert!(prefs.email_enabled);
        assert_eq!(prefs.recipient_for(Channel::Sms), Some("+15550001111"));
        assert_eq!(prefs.digest_frequency, DigestFrequency::Weekly);
        assert_eq!(prefs.digest_time, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        assert_eq!(prefs.timezone, "-05:00");
    }

    #[test]
    fn apply_rejects_bad_timezone() {
        let mut prefs = UserPreference::defaults(1);
        let update = UpdatePreferences {
            timezone: Some("Mars/Olympus".into()),
            ..Default::default()
        };
        assert!(prefs.apply(&update).is_err());
    }

    #[test]
    fn dnd_null_clears_and_absent_keeps() {
        let mut prefs = UserPreference::defaults(1);
        prefs.dnd_until = Some(chrono::Utc::now());

        let absent: UpdatePreferences = serde_json::from_value(serde_json::json!({})).unwrap();
        prefs.apply(&absent).unwrap();
        assert!(prefs.dnd_until.is_some());

        let cleared: UpdatePreferences =
            serde_json::from_value(serde_json::json!({"dndUntil": null})).unwrap();
        prefs.apply(&cleared).unwrap();
        assert!(prefs.dnd_until.is_none());
    }

    #[test]
    fn empty_contact_point_clears_it() {
        let mut prefs = UserPreference::defaults(1);
        prefs.email_address = Some("a@example.com".into());
        let update = UpdatePreferences {
            email_address: Some("  ".into()),
            ..Default::default()
        };
        prefs.apply(&update).unwrap();
        assert_eq!(prefs.recipient_for(Channel::Email), None);
    }
}
