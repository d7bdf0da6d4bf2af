//! The entity store: every table the transition engine and scheduling
//! policy read and write, collected behind one struct so ownership stays
//! simple. Cross-entity relationships (`task.who_has` vs `worker.has_what`,
//! `task.who_wants` vs `client.wants_what`) are modeled as plain reference
//! fields on both sides; nothing here is an owning cycle. Every mutation
//! that touches one side of such a relation goes through a helper that
//! updates the other side in the same call, so the two never drift.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::client::ClientState;
use crate::computation::Computation;
use crate::config::SchedulerConfig;
use crate::group::TaskGroup;
use crate::ids::{ClientId, GroupKey, PrefixKey, StimulusId, TaskKey, Timestamp, WorkerAddr};
use crate::prefix::TaskPrefix;
use crate::task::{Task, TaskState};
use crate::worker::WorkerState;

#[derive(Clone, Debug)]
pub struct TransitionLogEntry {
    pub key: TaskKey,
    pub start: TaskState,
    pub finish: TaskState,
    pub stimulus_id: StimulusId,
    pub at: Timestamp,
}

pub struct Store {
    pub config: SchedulerConfig,

    pub tasks: BTreeMap<TaskKey, Task>,
    pub workers: BTreeMap<WorkerAddr, WorkerState>,
    pub clients: BTreeMap<ClientId, ClientState>,
    pub prefixes: BTreeMap<PrefixKey, TaskPrefix>,
    pub groups: BTreeMap<GroupKey, TaskGroup>,
    pub computations: VecDeque<Computation>,

    pub running: BTreeSet<WorkerAddr>,
    pub idle: BTreeSet<WorkerAddr>,
    pub saturated: BTreeSet<WorkerAddr>,

    pub total_nthreads: u32,
    pub total_occupancy: f64,
    pub n_tasks: u64,
    pub generation: i64,
    pub last_submission_time: Timestamp,

    pub transition_log: VecDeque<TransitionLogEntry>,

    /// Durations observed for prefixes that had no prior estimate, keyed so
    /// parked estimates can be revised once the first sample lands.
    pub unknown_durations: BTreeMap<PrefixKey, Vec<TaskKey>>,
}

impl Store {
    pub fn new(config: SchedulerConfig) -> Store {
        let mut store = Store {
            config,
            tasks: BTreeMap::new(),
            workers: BTreeMap::new(),
            clients: BTreeMap::new(),
            prefixes: BTreeMap::new(),
            groups: BTreeMap::new(),
            computations: VecDeque::new(),
            running: BTreeSet::new(),
            idle: BTreeSet::new(),
            saturated: BTreeSet::new(),
            total_nthreads: 0,
            total_occupancy: 0.0,
            n_tasks: 0,
            generation: 0,
            last_submission_time: Timestamp(0.0),
            transition_log: VecDeque::new(),
            unknown_durations: BTreeMap::new(),
        };
        store.clients.insert(
            ClientId::from(crate::client::FIRE_AND_FORGET),
            ClientState::new(ClientId::from(crate::client::FIRE_AND_FORGET)),
        );
        store
    }

    pub fn ensure_prefix(&mut self, name: &PrefixKey) -> &mut TaskPrefix {
        let seed = self.config.default_task_durations.get(name).copied();
        self.prefixes.entry(name.clone()).or_insert_with(|| TaskPrefix::new(name.clone(), seed))
    }

    pub fn ensure_group(&mut self, group_key: &GroupKey, prefix: &PrefixKey) -> &mut TaskGroup {
        self.ensure_prefix(prefix);
        if let Some(p) = self.prefixes.get_mut(prefix) {
            if !p.groups.contains(group_key) {
                p.groups.push(group_key.clone());
            }
        }
        self.groups
            .entry(group_key.clone())
            .or_insert_with(|| TaskGroup::new(group_key.clone(), prefix.clone()))
    }

    /// Records that `key` was assigned to a worker while its prefix had no
    /// duration estimate yet, so its guessed cost can be revised once a real
    /// observation for the prefix lands.
    pub fn park_unknown_duration(&mut self, prefix: &PrefixKey, key: &TaskKey) {
        self.unknown_durations.entry(prefix.clone()).or_default().push(key.clone());
    }

    /// Removes and returns every task parked against `prefix`, if any.
    pub fn take_unknown_durations(&mut self, prefix: &PrefixKey) -> Vec<TaskKey> {
        self.unknown_durations.remove(prefix).unwrap_or_default()
    }

    pub fn log_transition(
        &mut self,
        key: TaskKey,
        start: TaskState,
        finish: TaskState,
        stimulus_id: StimulusId,
        at: Timestamp,
    ) {
        self.transition_log.push_back(TransitionLogEntry { key, start, finish, stimulus_id, at });
        while self.transition_log.len() > self.config.transition_log_length {
            self.transition_log.pop_front();
        }
    }

    /// Adds `worker` as a replica holder of `key`, keeping `who_has` and
    /// `has_what` in lockstep. No-op if the replica already exists.
    pub fn add_replica(&mut self, key: &TaskKey, worker: &WorkerAddr) {
        let nbytes = self
            .tasks
            .get(key)
            .map(|t| t.effective_nbytes(self.config.default_data_size))
            .unwrap_or(self.config.default_data_size);
        if let Some(t) = self.tasks.get_mut(key) {
            t.who_has.insert(worker.clone());
        }
        if let Some(w) = self.workers.get_mut(worker) {
            w.add_replica(key.clone(), nbytes);
        }
    }

    /// Removes `worker` as a replica holder of `key`.
    pub fn remove_replica(&mut self, key: &TaskKey, worker: &WorkerAddr) {
        let nbytes = self
            .tasks
            .get(key)
            .map(|t| t.effective_nbytes(self.config.default_data_size))
            .unwrap_or(self.config.default_data_size);
        if let Some(t) = self.tasks.get_mut(key) {
            t.who_has.remove(worker);
        }
        if let Some(w) = self.workers.get_mut(worker) {
            w.remove_replica(key, nbytes);
        }
    }

    /// Drops every replica of `key` across all current holders.
    pub fn clear_replicas(&mut self, key: &TaskKey) -> Vec<WorkerAddr> {
        let holders: Vec<WorkerAddr> =
            self.tasks.get(key).map(|t| t.who_has.iter().cloned().collect()).unwrap_or_default();
        for w in &holders {
            self.remove_replica(key, w);
        }
        holders
    }

    pub fn recompute_idle_saturated(&mut self, worker: &WorkerAddr) {
        let cluster_avg = if self.total_nthreads > 0 {
            self.total_occupancy / self.total_nthreads as f64
        } else {
            0.0
        };
        let Some(w) = self.workers.get(worker) else { return };
        let p = w.processing_count() as f64;
        let nc = w.nthreads as f64;
        self.idle.remove(worker);
        self.saturated.remove(worker);
        if p < nc || w.occupancy < nc * cluster_avg / 2.0 {
            if self.running.contains(worker) {
                self.idle.insert(worker.clone());
            }
        } else if p > nc {
            let pending_frac = if p > 0.0 { w.occupancy * (p - nc) / (p * nc) } else { 0.0 };
            if pending_frac > 0.4 && pending_frac > 1.9 * cluster_avg {
                self.saturated.insert(worker.clone());
            }
        }
    }

    /// Recomputes one worker's occupancy and the cluster total, then its
    /// idle/saturated membership. Called after every change to a worker's
    /// `processing` map.
    pub fn reconcile_worker_occupancy(&mut self, worker: &WorkerAddr, old_occupancy: f64) {
        let new_occupancy = match self.workers.get_mut(worker) {
            Some(w) => {
                w.recompute_occupancy();
                w.occupancy
            }
            None => return,
        };
        self.total_occupancy += new_occupancy - old_occupancy;
        self.recompute_idle_saturated(worker);
    }
}
