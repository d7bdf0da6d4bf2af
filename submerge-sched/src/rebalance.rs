//! Memory rebalancing: the two-heap sender/recipient pairing algorithm.
//!
//! Complexity is `O(W + K log W)` for `W` eligible workers and `K` moves:
//! each worker enters the sender or recipient heap once, and every move
//! does at most one re-heap on each side.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet};

use ordered_float::OrderedFloat;

use crate::config::RebalanceMeasure;
use crate::ids::{Timestamp, WorkerAddr};
use crate::store::Store;
use crate::task::TaskKey;

#[derive(Clone, Debug)]
pub struct RebalanceMove {
    pub sender: WorkerAddr,
    pub recipient: WorkerAddr,
    pub key: TaskKey,
}

#[derive(Clone, Debug, Default)]
pub struct RebalancePlan {
    pub moves: Vec<RebalanceMove>,
}

fn worker_measure(store: &Store, worker: &WorkerAddr, now: Timestamp) -> i64 {
    let Some(w) = store.workers.get(worker) else { return 0 };
    match store.config.memory_rebalance_measure {
        RebalanceMeasure::Managed => w.nbytes,
        RebalanceMeasure::Process => {
            w.memory_history.back().map(|(_, v)| *v).unwrap_or(w.nbytes)
        }
        RebalanceMeasure::Optimistic => {
            w.nbytes + w.unmanaged_old(now, store.config.memory_recent_to_old_time)
        }
    }
}

/// A heap entry for a sender: ordered so the worker furthest above the
/// rebalance threshold is drained first.
#[derive(Clone)]
struct SenderEntry {
    key: (OrderedFloat<f64>, OrderedFloat<f64>, WorkerAddr),
    memory: i64,
    half_gap: f64,
}

impl SenderEntry {
    fn new(worker: &WorkerAddr, memory: i64, mean: f64, half_gap: f64) -> SenderEntry {
        SenderEntry {
            key: (OrderedFloat(mean - memory as f64), OrderedFloat(half_gap - memory as f64), worker.clone()),
            memory,
            half_gap,
        }
    }
}
impl PartialEq for SenderEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for SenderEntry {}
impl PartialOrd for SenderEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SenderEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Clone)]
struct RecipientEntry {
    key: (OrderedFloat<f64>, OrderedFloat<f64>, WorkerAddr),
    memory: i64,
}
impl PartialEq for RecipientEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for RecipientEntry {}
impl PartialOrd for RecipientEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RecipientEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}
impl RecipientEntry {
    fn new(worker: &WorkerAddr, memory: i64, mean: f64, half_gap: f64) -> RecipientEntry {
        RecipientEntry {
            key: (OrderedFloat(memory as f64 - mean), OrderedFloat(half_gap), worker.clone()),
            memory,
        }
    }
}

/// Computes a rebalance plan without executing it; the dispatcher/
/// lifecycle layer turns the plan into `acquire-replicas`/`remove-replicas`
/// messages and tells the caller which moves, if any, failed.
pub fn plan_rebalance(
    store: &Store,
    now: Timestamp,
    worker_filter: Option<&BTreeSet<WorkerAddr>>,
    key_filter: Option<&BTreeSet<TaskKey>>,
) -> RebalancePlan {
    let eligible: Vec<WorkerAddr> = store
        .workers
        .keys()
        .filter(|w| worker_filter.map(|f| f.contains(*w)).unwrap_or(true))
        .cloned()
        .collect();
    if eligible.is_empty() {
        return RebalancePlan::default();
    }

    let memories: Vec<(WorkerAddr, i64)> =
        eligible.iter().map(|w| (w.clone(), worker_measure(store, w, now))).collect();
    let mean = memories.iter().map(|(_, m)| *m as f64).sum::<f64>() / memories.len() as f64;
    let gap = store.config.memory_rebalance_sender_recipient_gap;

    let mut sender_heap: BinaryHeap<Reverse<SenderEntry>> = BinaryHeap::new();
    let mut recipient_heap: BinaryHeap<Reverse<RecipientEntry>> = BinaryHeap::new();

    for (worker, memory) in &memories {
        let Some(w) = store.workers.get(worker) else { continue };
        let limit = w.memory_limit as f64;
        let half_gap = gap / 2.0 * limit;
        let has_data = !w.has_what.is_empty();
        if has_data
            && *memory as f64 >= mean + half_gap
            && *memory as f64 >= store.config.memory_rebalance_sender_min * limit
        {
            sender_heap.push(Reverse(SenderEntry::new(worker, *memory, mean, half_gap)));
        } else if (*memory as f64) < mean - half_gap
            && (*memory as f64) < store.config.memory_rebalance_recipient_max * limit
        {
            recipient_heap.push(Reverse(RecipientEntry::new(worker, *memory, mean, half_gap)));
        }
    }

    let mut plan = RebalancePlan::default();
    let mut cursors: std::collections::BTreeMap<WorkerAddr, usize> = std::collections::BTreeMap::new();

    while let Some(Reverse(sender)) = sender_heap.pop() {
        let sender_addr = sender.key.2.clone();
        let Some(sw) = store.workers.get(&sender_addr) else { continue };
        let keys: Vec<TaskKey> = sw.has_what.iter().cloned().collect();
        let start = *cursors.get(&sender_addr).unwrap_or(&0);

        let mut moved = false;
        let mut idx = start;
        while idx < keys.len() {
            let key = &keys[idx];
            idx += 1;
            if let Some(filter) = key_filter {
                if !filter.contains(key) {
                    continue;
                }
            }
            let nbytes = store
                .tasks
                .get(key)
                .map(|t| t.effective_nbytes(store.config.default_data_size))
                .unwrap_or(store.config.default_data_size);

            let mut deferred = Vec::new();
            let mut matched = None;
            while let Some(Reverse(recipient)) = recipient_heap.pop() {
                let recipient_addr = recipient.key.2.clone();
                let already_has =
                    store.workers.get(&recipient_addr).map(|w| w.has_what.contains(key)).unwrap_or(true);
                let limit = store.workers.get(&recipient_addr).map(|w| w.memory_limit).unwrap_or(0) as f64;
                let fits = (recipient.memory as f64 + nbytes as f64)
                    < store.config.memory_rebalance_recipient_max * limit;
                if !already_has && fits {
                    matched = Some((recipient_addr, recipient.memory));
                    break;
                }
                deferred.push(recipient);
            }
            for d in deferred {
                recipient_heap.push(Reverse(d));
            }

            if let Some((recipient_addr, recipient_memory)) = matched {
                plan.moves.push(RebalanceMove {
                    sender: sender_addr.clone(),
                    recipient: recipient_addr.clone(),
                    key: key.clone(),
                });

                let new_recipient_memory = recipient_memory + nbytes;
                let r_half_gap =
                    gap / 2.0 * store.workers.get(&recipient_addr).map(|w| w.memory_limit).unwrap_or(0) as f64;
                if (new_recipient_memory as f64) < mean - r_half_gap {
                    recipient_heap.push(Reverse(RecipientEntry::new(
                        &recipient_addr,
                        new_recipient_memory,
                        mean,
                        r_half_gap,
                    )));
                }

                let new_sender_memory = sender.memory - nbytes;
                if (new_sender_memory as f64) >= mean + sender.half_gap {
                    sender_heap.push(Reverse(SenderEntry::new(&sender_addr, new_sender_memory, mean, sender.half_gap)));
                }
                cursors.insert(sender_addr.clone(), idx);
                moved = true;
                break;
            }
        }
        if !moved {
            continue;
        }
    }

    plan
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::task::{Task, UNKNOWN_NBYTES};
    use crate::ids::{GroupKey, Priority};
    use crate::worker::WorkerState;

    fn setup() -> Store {
        let mut cfg = SchedulerConfig::default();
        cfg.memory_rebalance_sender_min = 0.3;
        cfg.memory_rebalance_recipient_max = 0.6;
        cfg.memory_rebalance_sender_recipient_gap = 0.1;
        let mut store = Store::new(cfg);

        let a = WorkerAddr::from("tcp://a:1");
        let b = WorkerAddr::from("tcp://b:1");
        let mut wa = WorkerState::new(a.clone(), "a".into(), 2, 2000);
        let wb = WorkerState::new(b.clone(), "b".into(), 2, 2000);

        for i in 0..6 {
            let key = TaskKey::from(format!("k{i}").as_str());
            let mut t = Task::new(key.clone(), GroupKey::from("f-1"), Priority::new(0, 0, i));
            t.nbytes = 200;
            t.who_has.insert(a.clone());
            store.tasks.insert(key.clone(), t);
            wa.add_replica(key, 200);
        }
        store.workers.insert(a, wa);
        store.workers.insert(b, wb);
        store
    }

    #[test]
    fn moves_oldest_keys_to_empty_recipient() {
        let store = setup();
        let plan = plan_rebalance(&store, Timestamp(0.0), None, None);
        assert!(!plan.moves.is_empty());
        let a = WorkerAddr::from("tcp://a:1");
        let b = WorkerAddr::from("tcp://b:1");
        for (i, mv) in plan.moves.iter().enumerate() {
            assert_eq!(mv.sender, a);
            assert_eq!(mv.recipient, b);
            assert_eq!(mv.key, TaskKey::from(format!("k{i}").as_str()));
        }
    }

    #[test]
    fn no_moves_when_balanced() {
        let mut store = setup();
        // Even both workers out so neither crosses a threshold.
        let b = WorkerAddr::from("tcp://b:1");
        for i in 0..6 {
            let key = TaskKey::from(format!("k{i}").as_str());
            if i % 2 == 0 {
                continue;
            }
            if let Some(t) = store.tasks.get_mut(&key) {
                t.who_has.insert(b.clone());
                t.nbytes = UNKNOWN_NBYTES;
                t.nbytes = 200;
            }
            store.workers.get_mut(&b).unwrap().add_replica(key.clone(), 200);
            let a = WorkerAddr::from("tcp://a:1");
            store.workers.get_mut(&a).unwrap().remove_replica(&key, 200);
            if let Some(t) = store.tasks.get_mut(&key) {
                t.who_has.remove(&a);
            }
        }
        let plan = plan_rebalance(&store, Timestamp(0.0), None, None);
        assert!(plan.moves.is_empty());
    }
}
