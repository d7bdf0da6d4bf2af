//! The `Task`, the atom of scheduling.
//!
//! A task moves through exactly seven states; see `transition.rs` for the
//! edges between them. This module only holds data and the small per-field
//! invariants that are cheap to check inline (the expensive cross-entity
//! invariants live behind `Config::validate` in `store.rs`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, GroupKey, Priority, TaskKey, WorkerAddr};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Released,
    Waiting,
    NoWorker,
    Processing,
    Memory,
    Erred,
    Forgotten,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Released,
        TaskState::Waiting,
        TaskState::NoWorker,
        TaskState::Processing,
        TaskState::Memory,
        TaskState::Erred,
        TaskState::Forgotten,
    ];
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestrictionMode {
    Strict,
    Loose,
}

#[derive(Clone, Debug, Default)]
pub struct Restrictions {
    pub worker: Option<BTreeSet<WorkerAddr>>,
    pub host: Option<BTreeSet<String>>,
    pub resources: Option<BTreeSet<(String, u64)>>,
    pub mode: Option<RestrictionMode>,
}

impl Restrictions {
    pub fn is_empty(&self) -> bool {
        self.worker.is_none() && self.host.is_none() && self.resources.is_none()
    }
}

/// -1 (`nbytes < 0`) means "unknown"; callers fall back to the configured
/// default data size rather than treating it as a literal byte count.
pub const UNKNOWN_NBYTES: i64 = -1;

#[derive(Clone, Debug)]
pub struct Task {
    pub key: TaskKey,
    pub run_spec: Option<Vec<u8>>,
    pub priority: Priority,
    pub state: TaskState,
    pub group_key: GroupKey,

    pub dependencies: BTreeSet<TaskKey>,
    pub dependents: BTreeSet<TaskKey>,
    pub waiting_on: BTreeSet<TaskKey>,
    pub waiters: BTreeSet<TaskKey>,

    pub who_wants: BTreeSet<ClientId>,
    pub who_has: BTreeSet<WorkerAddr>,
    pub processing_on: Option<WorkerAddr>,

    pub nbytes: i64,
    pub retries: u32,
    pub suspicious: u32,
    pub has_lost_dependencies: bool,
    pub restrictions: Restrictions,
    pub actor: bool,
    pub annotations: Vec<(String, String)>,

    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub exception_blame: Option<TaskKey>,
}

impl Task {
    pub fn new(key: TaskKey, group_key: GroupKey, priority: Priority) -> Task {
        Task {
            key,
            run_spec: None,
            priority,
            state: TaskState::Released,
            group_key,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            waiting_on: BTreeSet::new(),
            waiters: BTreeSet::new(),
            who_wants: BTreeSet::new(),
            who_has: BTreeSet::new(),
            processing_on: None,
            nbytes: UNKNOWN_NBYTES,
            retries: 0,
            suspicious: 0,
            has_lost_dependencies: false,
            restrictions: Restrictions::default(),
            actor: false,
            annotations: Vec::new(),
            exception: None,
            traceback: None,
            exception_blame: None,
        }
    }

    pub fn effective_nbytes(&self, default_data_size: i64) -> i64 {
        if self.nbytes < 0 {
            default_data_size
        } else {
            self.nbytes
        }
    }

    pub fn is_pure_data(&self) -> bool {
        self.run_spec.is_none()
    }
}
