//! Per-submission cohort of tasks sharing a prefix.
//!
//! A `TaskGroup` is the unit the root-task co-location heuristic in
//! `policy.rs` reasons about: "this cohort is big and shallow, keep it on
//! one worker for a while" only makes sense per-group, not per-prefix
//! (two unrelated submissions of the same function should not share a
//! co-location quota).

use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{GroupKey, PrefixKey, WorkerAddr};
use crate::task::TaskState;

#[derive(Clone, Debug)]
pub struct TaskGroup {
    pub name: GroupKey,
    pub prefix: PrefixKey,
    pub states: BTreeMap<&'static str, u64>,
    pub dependencies: BTreeSet<GroupKey>,
    pub nbytes_total: i64,
    pub duration: f64,
    pub start: Option<f64>,
    pub stop: Option<f64>,
    pub last_worker: Option<WorkerAddr>,
    pub last_worker_tasks_left: u64,
}

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Released => "released",
        TaskState::Waiting => "waiting",
        TaskState::NoWorker => "no-worker",
        TaskState::Processing => "processing",
        TaskState::Memory => "memory",
        TaskState::Erred => "erred",
        TaskState::Forgotten => "forgotten",
    }
}

impl TaskGroup {
    pub fn new(name: GroupKey, prefix: PrefixKey) -> TaskGroup {
        let mut states = BTreeMap::new();
        for s in TaskState::ALL {
            states.insert(state_label(s), 0);
        }
        TaskGroup {
            name,
            prefix,
            states,
            dependencies: BTreeSet::new(),
            nbytes_total: 0,
            duration: 0.0,
            start: None,
            stop: None,
            last_worker: None,
            last_worker_tasks_left: 0,
        }
    }

    pub fn add(&mut self, state: TaskState) {
        *self.states.entry(state_label(state)).or_insert(0) += 1;
    }

    pub fn move_state(&mut self, from: TaskState, to: TaskState) {
        if let Some(c) = self.states.get_mut(state_label(from)) {
            *c = c.saturating_sub(1);
        }
        *self.states.entry(state_label(to)).or_insert(0) += 1;
    }

    pub fn count(&self) -> u64 {
        self.states.values().sum::<u64>() - *self.states.get("forgotten").unwrap_or(&0)
    }

    pub fn released_or_waiting(&self) -> u64 {
        self.states.get("released").copied().unwrap_or(0)
            + self.states.get("waiting").copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_and_move_tracks_counts() {
        let mut g = TaskGroup::new(GroupKey::from("f-abc"), PrefixKey::from("f"));
        g.add(TaskState::Released);
        g.add(TaskState::Released);
        assert_eq!(g.count(), 2);
        g.move_state(TaskState::Released, TaskState::Waiting);
        assert_eq!(g.states["released"], 1);
        assert_eq!(g.states["waiting"], 1);
    }

    #[test]
    fn forgotten_excluded_from_count() {
        let mut g = TaskGroup::new(GroupKey::from("f-abc"), PrefixKey::from("f"));
        g.add(TaskState::Memory);
        g.move_state(TaskState::Memory, TaskState::Forgotten);
        assert_eq!(g.count(), 0);
        assert!(g.is_empty());
    }
}
