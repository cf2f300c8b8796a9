//! Dashboard delivery metrics computed from attempt counts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use pitchey_core::channels::Channel;
use pitchey_core::delivery::DeliveryStatus;
use pitchey_core::error::CoreError;
use pitchey_core::types::Timestamp;
use pitchey_db::models::notification::AttemptCount;
use serde::Serialize;

use crate::store::{NotificationStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Attempts handed to a provider: `sent`, `delivered` and `bounced`.
    Sent,
    Delivered,
    Failed,
    Bounced,
    RateLimited,
    /// `delivered / sent`, between 0 and 1.
    DeliveryRate,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Sent => "sent",
            Metric::Delivered => "delivered",
            Metric::Failed => "failed",
            Metric::Bounced => "bounced",
            Metric::RateLimited => "rate_limited",
            Metric::DeliveryRate => "delivery_rate",
        }
    }
}

impl FromStr for Metric {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Metric::Sent),
            "delivered" => Ok(Metric::Delivered),
            "failed" => Ok(Metric::Failed),
            "bounced" => Ok(Metric::Bounced),
            "rate_limited" => Ok(Metric::RateLimited),
            "delivery_rate" => Ok(Metric::DeliveryRate),
            other => Err(CoreError::Validation(format!("Unknown metric: {other}"))),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look-back window of a metric query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn duration(self) -> Duration {
        match self {
            TimeRange::LastHour => Duration::hours(1),
            TimeRange::LastDay => Duration::hours(24),
            TimeRange::LastWeek => Duration::days(7),
            TimeRange::LastMonth => Duration::days(30),
        }
    }
}

impl FromStr for TimeRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TimeRange::LastHour),
            "24h" => Ok(TimeRange::LastDay),
            "7d" => Ok(TimeRange::LastWeek),
            "30d" => Ok(TimeRange::LastMonth),
            other => Err(CoreError::Validation(format!(
                "Invalid timeRange '{other}', expected 1h, 24h, 7d or 30d"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReport {
    pub metric: Metric,
    pub time_range: TimeRange,
    pub total: f64,
    pub by_channel: BTreeMap<Channel, f64>,
}

/// Evaluate `metric` over aggregated attempt counts.
pub fn compute(metric: Metric, counts: &[AttemptCount]) -> (f64, BTreeMap<Channel, f64>) {
    let count_where = |channel: Option<Channel>, statuses: &[DeliveryStatus]| -> i64 {
        counts
            .iter()
            .filter(|c| channel.map_or(true, |ch| c.channel == ch))
            .filter(|c| statuses.contains(&c.status))
            .map(|c| c.count)
            .sum()
    };

    let value = |channel: Option<Channel>| -> f64 {
        use DeliveryStatus::*;
        let handed_off = [Sent, Delivered, Bounced];
        match metric {
            Metric::Sent => count_where(channel, &handed_off) as f64,
            Metric::Delivered => count_where(channel, &[Delivered]) as f64,
            Metric::Failed => count_where(channel, &[Failed]) as f64,
            Metric::Bounced => count_where(channel, &[Bounced]) as f64,
            Metric::RateLimited => count_where(channel, &[RateLimited]) as f64,
            Metric::DeliveryRate => {
                let sent = count_where(channel, &handed_off);
                if sent == 0 {
                    0.0
                } else {
                    count_where(channel, &[Delivered]) as f64 / sent as f64
                }
            }
        }
    };

    let by_channel = Channel::ALL
        .into_iter()
        .map(|channel| (channel, value(Some(channel))))
        .collect();
    (value(None), by_channel)
}

/// Build the dashboard report for attempts created within `range` of `now`.
pub async fn report(
    store: &dyn NotificationStore,
    metric: Metric,
    range: TimeRange,
    now: Timestamp,
) -> Result<MetricReport, StoreError> {
    let counts = store.attempt_counts_since(now - range.duration()).await?;
    let (total, by_channel) = compute(metric, &counts);
    Ok(MetricReport {
        metric,
        time_range: range,
        total,
        by_channel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(channel: Channel, status: DeliveryStatus, count: i64) -> AttemptCount {
        AttemptCount {
            channel,
            status,
            count,
        }
    }

    fn sample() -> Vec<AttemptCount> {
        vec![
            count(Channel::Email, DeliveryStatus::Sent, 3),
            count(Channel::Email, DeliveryStatus::Delivered, 5),
            count(Channel::Email, DeliveryStatus::Bounced, 2),
            count(Channel::Sms, DeliveryStatus::Failed, 4),
            count(Channel::InApp, DeliveryStatus::RateLimited, 7),
        ]
    }

    #[test]
    fn sent_counts_everything_handed_off() {
        let (total, by_channel) = compute(Metric::Sent, &sample());
        assert_eq!(total, 10.0);
        assert_eq!(by_channel[&Channel::Email], 10.0);
        assert_eq!(by_channel[&Channel::Sms], 0.0);
    }

    #[test]
    fn delivery_rate_is_delivered_over_sent() {
        let (total, by_channel) = compute(Metric::DeliveryRate, &sample());
        assert!((total - 0.5).abs() < f64::EPSILON);
        assert_eq!(by_channel[&Channel::Push], 0.0);
    }

    #[test]
    fn status_metrics_count_one_status() {
        assert_eq!(compute(Metric::Failed, &sample()).0, 4.0);
        assert_eq!(compute(Metric::RateLimited, &sample()).0, 7.0);
        assert_eq!(compute(Metric::Bounced, &sample()).0, 2.0);
    }

    #[test]
    fn every_channel_is_reported() {
        let (_, by_channel) = compute(Metric::Delivered, &[]);
        assert_eq!(by_channel.len(), Channel::ALL.len());
    }

    #[test]
    fn time_range_parses_dashboard_values() {
        assert_eq!("7d".parse::<TimeRange>().unwrap(), TimeRange::LastWeek);
        assert!("2w".parse::<TimeRange>().is_err());
        assert_eq!(TimeRange::default(), TimeRange::LastDay);
    }

    #[test]
    fn report_serializes_channel_keys() {
        let (total, by_channel) = compute(Metric::Sent, &sample());
        let report = MetricReport {
            metric: Metric::Sent,
            time_range: TimeRange::LastHour,
            total,
            by_channel,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["timeRange"], "1h");
        assert_eq!(json["byChannel"]["email"], 10.0);
    }
}
