//! Worker-side bookkeeping: what a worker holds, what it is computing, and
//! the rolling estimates (occupancy, bandwidth, process memory) the policy
//! module reads when choosing where to place the next task.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::ids::{Timestamp, WorkerAddr};
use crate::orderedset::OrderedSet;
use crate::task::TaskKey;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerStatus {
    Init,
    Running,
    Paused,
    ClosingGracefully,
    Closed,
}

#[derive(Clone, Debug)]
pub struct WorkerState {
    pub address: WorkerAddr,
    pub name: Option<String>,
    pub host: String,
    pub status: WorkerStatus,
    pub nthreads: u32,
    pub memory_limit: i64,

    pub processing: BTreeMap<TaskKey, f64>,
    pub executing: BTreeMap<TaskKey, f64>,
    pub long_running: BTreeSet<TaskKey>,
    pub has_what: OrderedSet<TaskKey>,
    pub nbytes: i64,

    pub resources: BTreeMap<String, u64>,
    pub used_resources: BTreeMap<String, u64>,

    pub occupancy: f64,
    pub bandwidth: f64,
    pub last_seen: Timestamp,
    pub clock_delay: f64,

    /// Bounded ring of recent process-memory samples, used to compute
    /// `unmanaged_old` for the optimistic rebalance measure.
    pub memory_history: VecDeque<(Timestamp, i64)>,
    pub nanny: Option<String>,
}

impl WorkerState {
    pub fn new(address: WorkerAddr, host: String, nthreads: u32, memory_limit: i64) -> WorkerState {
        WorkerState {
            address,
            name: None,
            host,
            status: WorkerStatus::Init,
            nthreads,
            memory_limit,
            processing: BTreeMap::new(),
            executing: BTreeMap::new(),
            long_running: BTreeSet::new(),
            has_what: OrderedSet::new(),
            nbytes: 0,
            resources: BTreeMap::new(),
            used_resources: BTreeMap::new(),
            occupancy: 0.0,
            bandwidth: 100_000_000.0,
            last_seen: Timestamp(0.0),
            clock_delay: 0.0,
            memory_history: VecDeque::new(),
            nanny: None,
        }
    }

    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    /// Sum of processing cost for every task not marked long-running; a
    /// task that announced it will occupy a thread indefinitely is excluded
    /// from the occupancy total it would otherwise distort forever.
    pub fn recompute_occupancy(&mut self) {
        self.occupancy = self
            .processing
            .iter()
            .filter(|(k, _)| !self.long_running.contains(*k))
            .map(|(_, cost)| *cost)
            .sum();
    }

    pub fn add_replica(&mut self, key: TaskKey, nbytes: i64) {
        if self.has_what.insert(key) {
            self.nbytes += nbytes;
        }
    }

    pub fn remove_replica(&mut self, key: &TaskKey, nbytes: i64) {
        if self.has_what.remove(key) {
            self.nbytes -= nbytes;
        }
    }

    pub fn push_memory_sample(&mut self, at: Timestamp, rss: i64, bound: usize) {
        self.memory_history.push_back((at, rss));
        while self.memory_history.len() > bound {
            self.memory_history.pop_front();
        }
    }

    /// The minimum unmanaged memory observed within `recent_to_old_time`
    /// seconds of `now`; falls back to the oldest sample if the window
    /// holds nothing, and to zero if no samples exist yet.
    pub fn unmanaged_old(&self, now: Timestamp, recent_to_old_time: f64) -> i64 {
        let cutoff = now.0 - recent_to_old_time;
        let mut candidates: Vec<i64> = self
            .memory_history
            .iter()
            .filter(|(t, _)| t.0 <= cutoff)
            .map(|(_, v)| *v)
            .collect();
        if candidates.is_empty() {
            candidates = self.memory_history.iter().map(|(_, v)| *v).collect();
        }
        candidates.into_iter().min().unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn w() -> WorkerState {
        WorkerState::new(WorkerAddr::from("tcp://a:1"), "a".into(), 2, 1_000_000)
    }

    #[test]
    fn occupancy_excludes_long_running() {
        let mut worker = w();
        worker.processing.insert(TaskKey::from("x"), 1.0);
        worker.processing.insert(TaskKey::from("y"), 2.0);
        worker.long_running.insert(TaskKey::from("y"));
        worker.recompute_occupancy();
        assert_eq!(worker.occupancy, 1.0);
    }

    #[test]
    fn replica_accounting_tracks_nbytes() {
        let mut worker = w();
        worker.add_replica(TaskKey::from("x"), 100);
        worker.add_replica(TaskKey::from("x"), 100);
        assert_eq!(worker.nbytes, 100);
        worker.remove_replica(&TaskKey::from("x"), 100);
        assert_eq!(worker.nbytes, 0);
        assert!(!worker.has_what.contains(&TaskKey::from("x")));
    }
}
