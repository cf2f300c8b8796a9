//! Active A/B experiments, indexed by the event type whose content they vary.

use std::collections::HashMap;

use pitchey_core::event::EventType;
use pitchey_core::experiment::{Experiment, Variant};
use pitchey_core::types::DbId;

/// Registry loaded once from configuration. At most one experiment runs per
/// event type; a later definition for the same type replaces the earlier one.
#[derive(Debug, Clone, Default)]
pub struct ExperimentRegistry {
    by_event: HashMap<EventType, Experiment>,
}

impl ExperimentRegistry {
    pub fn from_experiments(experiments: impl IntoIterator<Item = Experiment>) -> Self {
        let mut by_event = HashMap::new();
        for experiment in experiments {
            if let Some(previous) = by_event.insert(experiment.event_type, experiment) {
                tracing::warn!(
                    experiment_id = %previous.id,
                    event_type = %previous.event_type,
                    "Experiment replaced by a later definition"
                );
            }
        }
        Self { by_event }
    }

    pub fn len(&self) -> usize {
        self.by_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }

    /// The variant `user_id` sees for `event_type`, with its experiment id.
    pub fn assign(&self, event_type: EventType, user_id: DbId) -> Option<(&str, &Variant)> {
        let experiment = self.by_event.get(&event_type)?;
        let variant = experiment.assign(user_id)?;
        Some((experiment.id.as_str(), variant))
    }
}
