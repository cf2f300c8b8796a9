//! Exponential backoff policy for failed delivery attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters for the retry schedule.
///
/// Defaults: base 30 s, factor 2, capped at 1 h, at most 5 attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Total attempts (including the first) before the attempt is
    /// terminally failed.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failed attempt (1-based), or
    /// `None` once the attempt budget is exhausted.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let exponent = (attempt - 1) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_from_thirty_seconds() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..5)
            .map(|n| policy.delay_after(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
    }

    #[test]
    fn fifth_failure_is_final() {
        assert_eq!(RetryPolicy::default().delay_after(5), None);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 20,
            ..Default::default()
        };
        assert_eq!(policy.delay_after(10), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_attempts_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_after(0), None);
    }
}
