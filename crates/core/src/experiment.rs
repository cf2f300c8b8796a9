//! Deterministic A/B variant assignment.
//!
//! A user's bucket for an experiment is derived from a SHA-256 of
//! `"<user_id>:<experiment_id>"`, so the same inputs always produce the same
//! variant without storing assignments. Changing an experiment's definition
//! means publishing it under a new experiment id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::EventType;
use crate::types::DbId;

/// Number of buckets the hash is reduced to.
pub const BUCKET_COUNT: u64 = 10_000;

/// One arm of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    /// Relative weight; weights need not sum to any particular total.
    pub weight: u32,
    /// Title template overriding the event type's default.
    #[serde(default)]
    pub title_template: Option<String>,
    /// Body template overriding the event type's default.
    #[serde(default)]
    pub body_template: Option<String>,
}

/// An A/B experiment on the content of one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub event_type: EventType,
    pub variants: Vec<Variant>,
}

impl Experiment {
    /// Assign `user_id` to one of this experiment's variants.
    pub fn assign(&self, user_id: DbId) -> Option<&Variant> {
        let weights: Vec<(&str, u32)> = self
            .variants
            .iter()
            .map(|v| (v.id.as_str(), v.weight))
            .collect();
        let chosen = assign_variant(user_id, &self.id, &weights)?;
        self.variants.iter().find(|v| v.id == chosen)
    }
}

/// Stable bucket in `0..BUCKET_COUNT` for a user within an experiment.
pub fn bucket(user_id: DbId, experiment_id: &str) -> u64 {
    let digest = Sha256::digest(format!("{user_id}:{experiment_id}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % BUCKET_COUNT
}

/// Pick a variant id for `user_id` using weighted buckets.
///
/// Weights are scaled onto the `BUCKET_COUNT` slots in declaration order.
/// Returns `None` when there are no variants or every weight is zero.
pub fn assign_variant(user_id: DbId, experiment_id: &str, weights: &[(&str, u32)]) -> Option<String> {
    let total: u64 = weights.iter().map(|(_, w)| u64::from(*w)).sum();
    if total == 0 {
        return None;
    }

    let slot = bucket(user_id, experiment_id);
    let mut cumulative = 0u64;
    for (id, weight) in weights {
        cumulative += u64::from(*weight);
        if slot * total < cumulative * BUCKET_COUNT {
            return Some((*id).to_string());
        }
    }
    // Unreachable for total > 0, since the last arm covers the top bucket.
    weights.iter().rev().find(|(_, w)| *w > 0).map(|(id, _)| (*id).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_always_yield_same_variant() {
        let weights = [("control", 50), ("urgent_copy", 50)];
        let first = assign_variant(42, "nda-subject-2026q4", &weights).unwrap();
        for _ in 0..100 {
            assert_eq!(
                assign_variant(42, "nda-subject-2026q4", &weights).unwrap(),
                first
            );
        }
    }

    #[test]
    fn zero_weight_arm_is_never_chosen() {
        let weights = [("off", 0), ("on", 1)];
        for user in 0..500 {
            assert_eq!(assign_variant(user, "exp", &weights).as_deref(), Some("on"));
        }
    }

    #[test]
    fn all_zero_weights_assign_nothing() {
        assert!(assign_variant(1, "exp", &[("a", 0), ("b", 0)]).is_none());
        assert!(assign_variant(1, "exp", &[]).is_none());
    }

    #[test]
    fn split_is_roughly_proportional() {
        let weights = [("a", 80), ("b", 20)];
        let a_count = (0..5_000)
            .filter(|u| assign_variant(*u, "split-check", &weights).as_deref() == Some("a"))
            .count();
        // 80% of 5000 = 4000; allow generous slack for hash variance.
        assert!((3_700..=4_300).contains(&a_count), "got {a_count}");
    }

    #[test]
    fn bucket_depends_on_experiment_id() {
        let differing = (0..200)
            .filter(|u| bucket(*u, "exp-a") != bucket(*u, "exp-b"))
            .count();
        assert!(differing > 150);
    }

    #[test]
    fn experiment_assign_returns_variant_definition() {
        let experiment = Experiment {
            id: "follow-copy".into(),
            event_type: EventType::Follow,
            variants: vec![Variant {
                id: "friendly".into(),
                weight: 1,
                title_template: Some("{follower_name} is following you!".into()),
                body_template: None,
            }],
        };
        let variant = experiment.assign(9).unwrap();
        assert_eq!(variant.id, "friendly");
    }
}
