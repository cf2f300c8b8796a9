//! Delivery attempt status and state machine.
//!
//! Status ids match the `delivery_statuses` seed data (1-based SMALLINT).
//!
//! ```text
//! pending -> sent -> delivered
//!    |        '---> bounced
//!    |--> failed --(retry)--> pending
//!    '--> rate_limited
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status id type matching SMALLINT in the database.
pub type StatusId = i16;

/// Lifecycle state of one channel delivery.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending = 1,
    Sent = 2,
    Delivered = 3,
    Failed = 4,
    RateLimited = 5,
    Bounced = 6,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 6] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sent,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
        DeliveryStatus::RateLimited,
        DeliveryStatus::Bounced,
    ];

    /// Return the database status id.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    pub fn from_id(id: StatusId) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::RateLimited => "rate_limited",
            DeliveryStatus::Bounced => "bounced",
        }
    }

    /// States that can never be left, regardless of retry bookkeeping.
    ///
    /// `failed` is only terminal once no retry is scheduled; see
    /// [`is_terminal`].
    pub fn is_always_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Bounced | DeliveryStatus::RateLimited
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<StatusId> for DeliveryStatus {
    type Error = CoreError;

    fn try_from(value: StatusId) -> Result<Self, Self::Error> {
        Self::from_id(value)
            .ok_or_else(|| CoreError::Validation(format!("Unknown delivery status id: {value}")))
    }
}

/// Whether an attempt in `status` is finished for good.
///
/// A `failed` attempt with a scheduled retry is still live.
pub fn is_terminal(status: DeliveryStatus, retry_scheduled: bool) -> bool {
    status.is_always_terminal() || (status == DeliveryStatus::Failed && !retry_scheduled)
}

/// Returns the statuses reachable from `from`.
pub fn valid_transitions(from: DeliveryStatus) -> &'static [DeliveryStatus] {
    use DeliveryStatus::*;
    match from {
        Pending => &[Sent, Failed, RateLimited],
        Sent => &[Delivered, Bounced],
        Failed => &[Pending],
        Delivered | RateLimited | Bounced => &[],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a state transition, returning an error message for invalid ones.
pub fn validate_transition(from: DeliveryStatus, to: DeliveryStatus) -> Result<(), String> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(format!("Invalid transition: {from} -> {to}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryStatus::*;

    #[test]
    fn happy_path_is_allowed() {
        assert!(can_transition(Pending, Sent));
        assert!(can_transition(Sent, Delivered));
    }

    #[test]
    fn retry_loop_is_allowed() {
        assert!(can_transition(Pending, Failed));
        assert!(can_transition(Failed, Pending));
    }

    #[test]
    fn bounce_only_from_sent() {
        assert!(can_transition(Sent, Bounced));
        assert!(!can_transition(Pending, Bounced));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Delivered, Bounced, RateLimited] {
            for target in DeliveryStatus::ALL {
                assert!(
                    !can_transition(terminal, target),
                    "{terminal} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn sent_cannot_go_back_to_pending() {
        assert!(!can_transition(Sent, Pending));
        assert!(!can_transition(Sent, Failed));
    }

    #[test]
    fn failed_is_terminal_only_without_retry() {
        assert!(!is_terminal(Failed, true));
        assert!(is_terminal(Failed, false));
        assert!(!is_terminal(Pending, false));
        assert!(is_terminal(RateLimited, false));
    }

    #[test]
    fn status_ids_round_trip() {
        for status in DeliveryStatus::ALL {
            assert_eq!(DeliveryStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(DeliveryStatus::from_id(99), None);
    }

    #[test]
    fn validate_transition_message_names_both_states() {
        let err = validate_transition(Delivered, Pending).unwrap_err();
        assert_eq!(err, "Invalid transition: delivered -> pending");
    }
}
