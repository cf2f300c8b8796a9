//! Digest frequency and digest window arithmetic.
//!
//! A digest window is identified by `(user_id, window_key)`. The key names
//! the local calendar date on which the window flushes: `daily:YYYY-MM-DD`
//! for daily digests and `weekly:YYYY-MM-DD` (always a Monday) for weekly
//! ones. Every event queued before the flush instant lands in the same
//! window.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Default local time of day at which digests are flushed.
pub const DEFAULT_DIGEST_TIME: (u32, u32) = (9, 0);

/// How email notifications are batched for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Instant,
    Daily,
    Weekly,
    Never,
}

impl DigestFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestFrequency::Instant => "instant",
            DigestFrequency::Daily => "daily",
            DigestFrequency::Weekly => "weekly",
            DigestFrequency::Never => "never",
        }
    }

    pub fn is_batched(self) -> bool {
        matches!(self, DigestFrequency::Daily | DigestFrequency::Weekly)
    }
}

impl fmt::Display for DigestFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestFrequency {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instant" => Ok(DigestFrequency::Instant),
            "daily" => Ok(DigestFrequency::Daily),
            "weekly" => Ok(DigestFrequency::Weekly),
            "never" => Ok(DigestFrequency::Never),
            other => Err(CoreError::Validation(format!(
                "Unknown digest frequency: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for DigestFrequency {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Parse a timezone preference.
///
/// Accepts `UTC`/`Z` or a fixed offset `+HH:MM` / `-HH:MM`.
pub fn parse_timezone(tz: &str) -> Result<FixedOffset, CoreError> {
    let tz = tz.trim();
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" || tz.is_empty() {
        return Ok(Utc.fix());
    }
    let invalid = || CoreError::Validation(format!("Invalid timezone offset: {tz}"));
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// The digest window an event queued at `now` belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSlot {
    pub window_key: String,
    pub flush_at: Timestamp,
}

/// Compute the window slot for a batched frequency.
///
/// Returns `None` for `instant` and `never`, which have no window.
pub fn window_for(
    frequency: DigestFrequency,
    digest_time: NaiveTime,
    offset: FixedOffset,
    now: Timestamp,
) -> Option<WindowSlot> {
    let local_now = now.with_timezone(&offset);
    let today = local_now.date_naive();

    let flush_date = match frequency {
        DigestFrequency::Daily => {
            if local_now.time() < digest_time {
                today
            } else {
                today.checked_add_days(Days::new(1))?
            }
        }
        DigestFrequency::Weekly => {
            let days_to_monday = (7 - today.weekday().num_days_from_monday()) % 7;
            let monday = today.checked_add_days(Days::new(u64::from(days_to_monday)))?;
            if monday == today && local_now.time() >= digest_time {
                monday.checked_add_days(Days::new(7))?
            } else {
                monday
            }
        }
        DigestFrequency::Instant | DigestFrequency::Never => return None,
    };

    let flush_local = offset
        .from_local_datetime(&flush_date.and_time(digest_time))
        .single()?;

    Some(WindowSlot {
        window_key: format!("{}:{}", frequency.as_str(), flush_date.format("%Y-%m-%d")),
        flush_at: flush_local.with_timezone(&Utc),
    })
}
