//! Per-function duration statistics, shared by every `TaskGroup` whose
//! tasks invoke the same underlying function.

use std::collections::BTreeMap;

use crate::ids::PrefixKey;

#[derive(Clone, Debug)]
pub struct TaskPrefix {
    pub name: PrefixKey,
    /// Exponentially-weighted average observed duration, in seconds.
    /// `None` until the first `compute` observation (or a configured
    /// default) seeds it.
    pub duration_average: Option<f64>,
    pub all_durations: BTreeMap<String, f64>,
    pub suspicious: u32,
    pub groups: Vec<crate::ids::GroupKey>,
}

impl TaskPrefix {
    pub fn new(name: PrefixKey, seed: Option<f64>) -> TaskPrefix {
        TaskPrefix {
            name,
            duration_average: seed,
            all_durations: BTreeMap::new(),
            suspicious: 0,
            groups: Vec::new(),
        }
    }

    /// Folds one observed duration into the running average. Only
    /// `"compute"`-labelled observations move `duration_average`; other
    /// actions (e.g. transfer time) are accumulated in `all_durations` for
    /// introspection only, matching the source cluster's bookkeeping.
    pub fn add_duration(&mut self, action: &str, duration: f64) {
        *self.all_durations.entry(action.to_string()).or_insert(0.0) += duration;
        if action == "compute" {
            self.duration_average = Some(match self.duration_average {
                Some(old) if old >= 0.0 => 0.5 * duration + 0.5 * old,
                _ => duration,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_compute_seeds_average() {
        let mut p = TaskPrefix::new(PrefixKey::from("f"), None);
        p.add_duration("compute", 2.0);
        assert_eq!(p.duration_average, Some(2.0));
    }

    #[test]
    fn subsequent_compute_applies_ewma() {
        let mut p = TaskPrefix::new(PrefixKey::from("f"), Some(2.0));
        p.add_duration("compute", 4.0);
        assert_eq!(p.duration_average, Some(3.0));
    }

    #[test]
    fn non_compute_action_does_not_move_average() {
        let mut p = TaskPrefix::new(PrefixKey::from("f"), Some(2.0));
        p.add_duration("transfer", 10.0);
        assert_eq!(p.duration_average, Some(2.0));
        assert_eq!(p.all_durations.get("transfer"), Some(&10.0));
    }
}
