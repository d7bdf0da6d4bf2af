//! Worker selection: `decide_worker` and the estimators it leans on.
//!
//! This is the part of the scheduler with the most tuning knobs in the
//! original cluster it is modeled on, so it is kept as one module rather
//! than split further -- the root-task heuristic, the objective function,
//! and the fast path all share the same worker-iteration machinery.

use ordered_float::OrderedFloat;

use crate::ids::{TaskKey, WorkerAddr};
use crate::store::Store;
use crate::task::RestrictionMode;

/// Workers eligible for a task given its restrictions. `None` means "no
/// restriction, any worker qualifies." An empty set under `Strict` mode
/// means the task cannot run anywhere right now.
pub fn valid_workers(store: &Store, key: &TaskKey) -> Option<Vec<WorkerAddr>> {
    let t = store.tasks.get(key)?;
    if t.restrictions.is_empty() {
        return None;
    }

    let mut candidates: Vec<WorkerAddr> = store.workers.keys().cloned().collect();

    if let Some(allowed) = &t.restrictions.worker {
        candidates.retain(|w| allowed.contains(w));
    }
    if let Some(hosts) = &t.restrictions.host {
        candidates.retain(|w| store.workers.get(w).map(|ws| hosts.contains(&ws.host)).unwrap_or(false));
    }
    if let Some(resources) = &t.restrictions.resources {
        candidates.retain(|w| {
            let Some(ws) = store.workers.get(w) else { return false };
            resources.iter().all(|(res, qty)| {
                let have = ws.resources.get(res).copied().unwrap_or(0);
                let used = ws.used_resources.get(res).copied().unwrap_or(0);
                have.saturating_sub(used) >= *qty
            })
        });
    }

    Some(candidates)
}

fn comm_cost(store: &Store, key: &TaskKey, worker: &WorkerAddr) -> f64 {
    let Some(t) = store.tasks.get(key) else { return 0.0 };
    let bandwidth = store.workers.get(worker).map(|w| w.bandwidth).unwrap_or(store.config.bandwidth);
    let bytes: i64 = t
        .dependencies
        .iter()
        .filter_map(|d| store.tasks.get(d))
        .filter(|d| !d.who_has.contains(worker))
        .map(|d| d.effective_nbytes(store.config.default_data_size))
        .sum();
    if bandwidth <= 0.0 {
        0.0
    } else {
        bytes as f64 / bandwidth
    }
}

/// `occupancy / nthreads + comm_cost`, lower is better; ties broken by the
/// worker's resident byte count. Used both as the general objective and,
/// restricted to actor tasks, with the actor count prepended.
fn worker_objective(store: &Store, key: &TaskKey, worker: &WorkerAddr, actor: bool) -> (OrderedFloat<f64>, OrderedFloat<f64>, i64) {
    let Some(w) = store.workers.get(worker) else {
        return (OrderedFloat(f64::INFINITY), OrderedFloat(f64::INFINITY), i64::MAX);
    };
    let actor_component = if actor { w.processing.len() as f64 } else { 0.0 };
    let per_thread = if w.nthreads > 0 { w.occupancy / w.nthreads as f64 } else { w.occupancy };
    let cost = per_thread + comm_cost(store, key, worker);
    (OrderedFloat(actor_component), OrderedFloat(cost), w.nbytes)
}

fn quota_for(store: &Store, group_size: u64, worker: &WorkerAddr) -> u64 {
    let nthreads = store.workers.get(worker).map(|w| w.nthreads).unwrap_or(1) as u64;
    if store.total_nthreads == 0 {
        nthreads
    } else {
        ((group_size as f64 / store.total_nthreads as f64).floor() as u64) * nthreads
    }
}

/// Chooses a worker for `key`, or `None` if it must park in `no-worker`.
/// Mirrors the four-branch decision in the design notes: restriction
/// filtering, the root-task co-location heuristic, the objective-function
/// path for restricted/dependent tasks, and the round-robin fast path for
/// independent ones.
pub fn decide_worker(store: &mut Store, key: &TaskKey) -> Option<WorkerAddr> {
    if store.workers.is_empty() {
        return None;
    }

    // An empty restricted pool parks the task in `no-worker` unless its
    // restrictions are loose, in which case it falls back to treating the
    // task as unrestricted rather than refusing to schedule it at all.
    let mut restricted = valid_workers(store, key);
    if let Some(candidates) = &restricted {
        if candidates.is_empty() {
            let loose = store
                .tasks
                .get(key)
                .map(|t| t.restrictions.mode == Some(RestrictionMode::Loose))
                .unwrap_or(false);
            if loose {
                restricted = None;
            } else {
                return None;
            }
        }
    }

    let (has_deps, actor, group_key) = {
        let t = store.tasks.get(key)?;
        (!t.dependencies.is_empty(), t.actor, t.group_key.clone())
    };

    if restricted.is_none() && !has_deps {
        if let Some(root) = root_task_colocate(store, key, &group_key) {
            return Some(root);
        }
        return Some(fast_path(store));
    }

    let pool: Vec<WorkerAddr> = restricted.unwrap_or_else(|| store.workers.keys().cloned().collect());
    pool.into_iter().min_by_key(|w| worker_objective(store, key, w, actor))
}

fn root_task_colocate(store: &mut Store, _key: &TaskKey, group_key: &crate::ids::GroupKey) -> Option<WorkerAddr> {
    let group_size = store.groups.get(group_key).map(|g| g.count()).unwrap_or(0);
    if group_size <= 2 * store.total_nthreads as u64 {
        return None;
    }
    let dep_count = store.groups.get(group_key).map(|g| g.dependencies.len()).unwrap_or(0);
    if dep_count >= 5 {
        return None;
    }
    let dep_tasks: u64 = store
        .groups
        .get(group_key)
        .map(|g| g.dependencies.iter().filter_map(|d| store.groups.get(d)).map(|d| d.count()).sum())
        .unwrap_or(0);
    if dep_tasks >= 5 {
        return None;
    }

    let (remembered, left) = store
        .groups
        .get(group_key)
        .map(|g| (g.last_worker.clone(), g.last_worker_tasks_left))
        .unwrap_or((None, 0));

    if let Some(worker) = &remembered {
        if store.workers.contains_key(worker) && left > 0 {
            if let Some(g) = store.groups.get_mut(group_key) {
                g.last_worker_tasks_left -= 1;
            }
            forget_if_drained(store, group_key);
            return Some(worker.clone());
        }
    }

    let candidates: Vec<WorkerAddr> = if !store.idle.is_empty() {
        store.idle.iter().cloned().collect()
    } else {
        store.workers.keys().cloned().collect()
    };
    let chosen = candidates
        .into_iter()
        .min_by_key(|w| worker_objective(store, _key, w, false))?;
    let quota = quota_for(store, group_size, &chosen);
    if let Some(g) = store.groups.get_mut(group_key) {
        g.last_worker = Some(chosen.clone());
        g.last_worker_tasks_left = quota.saturating_sub(1);
    }
    forget_if_drained(store, group_key);
    Some(chosen)
}

fn forget_if_drained(store: &mut Store, group_key: &crate::ids::GroupKey) {
    if let Some(g) = store.groups.get_mut(group_key) {
        if g.released_or_waiting() < 2 {
            g.last_worker = None;
            g.last_worker_tasks_left = 0;
        }
    }
}

/// The no-dependency, no-restriction path: pick the idle worker with
/// lowest occupancy; tie on zero occupancy round-robins; at 20+ workers,
/// skip straight to pure round-robin since the marginal benefit of
/// comparing occupancies no longer justifies the O(W) scan.
fn fast_path(store: &mut Store) -> WorkerAddr {
    let workers: Vec<WorkerAddr> = store.workers.keys().cloned().collect();
    let n = workers.len();
    if n >= 20 {
        return workers[(store.n_tasks as usize) % n].clone();
    }

    let pool: Vec<WorkerAddr> = if !store.idle.is_empty() { store.idle.iter().cloned().collect() } else { workers.clone() };

    let min_occ = pool
        .iter()
        .filter_map(|w| store.workers.get(w).map(|ws| ws.occupancy))
        .fold(f64::INFINITY, f64::min);

    if min_occ <= 0.0 {
        let zero: Vec<&WorkerAddr> =
            pool.iter().filter(|w| store.workers.get(*w).map(|ws| ws.occupancy <= 0.0).unwrap_or(false)).collect();
        if !zero.is_empty() {
            let idx = (store.n_tasks as usize) % zero.len();
            return zero[idx].clone();
        }
    }

    pool.into_iter()
        .min_by(|a, b| {
            let oa = store.workers.get(a).map(|w| w.occupancy).unwrap_or(f64::INFINITY);
            let ob = store.workers.get(b).map(|w| w.occupancy).unwrap_or(f64::INFINITY);
            oa.partial_cmp(&ob).unwrap()
        })
        .unwrap_or_else(|| workers[0].clone())
}

/// Estimates the wall-clock cost of running `key` on `worker`: the
/// prefix's EWMA average plus transfer cost for dependencies not already
/// resident, or double the already-observed runtime if the task is
/// mid-flight and has exceeded twice its estimate (a straggler).
pub fn estimate_duration(store: &Store, key: &TaskKey, worker: &WorkerAddr) -> f64 {
    let Some(t) = store.tasks.get(key) else { return store.config.unknown_task_duration };
    let avg = store
        .groups
        .get(&t.group_key)
        .and_then(|g| store.prefixes.get(&g.prefix))
        .and_then(|p| p.duration_average);
    if let Some(w) = store.workers.get(worker) {
        if let (Some(observed), Some(avg)) = (w.executing.get(key), avg) {
            if *observed > 2.0 * avg {
                return 2.0 * observed;
            }
        }
    }
    avg.unwrap_or(store.config.unknown_task_duration) + comm_cost(store, key, worker)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::group::TaskGroup;
    use crate::ids::{GroupKey, Priority, PrefixKey};
    use crate::task::Task;
    use crate::worker::WorkerState;

    fn store_with_workers(n: usize) -> Store {
        let mut store = Store::new(SchedulerConfig::default());
        for i in 0..n {
            let addr = WorkerAddr::from(format!("tcp://w{i}:1").as_str());
            let w = WorkerState::new(addr.clone(), format!("h{i}"), 2, 1_000_000);
            store.total_nthreads += w.nthreads;
            store.workers.insert(addr.clone(), w);
            store.idle.insert(addr.clone());
            store.running.insert(addr);
        }
        store
    }

    #[test]
    fn fast_path_picks_lowest_occupancy() {
        let mut store = store_with_workers(3);
        let busy = WorkerAddr::from("tcp://w0:1");
        store.workers.get_mut(&busy).unwrap().occupancy = 5.0;
        store.idle.remove(&busy);
        let chosen = fast_path(&mut store);
        assert_ne!(chosen, busy);
    }

    #[test]
    fn restricted_empty_pool_returns_none() {
        let mut store = store_with_workers(1);
        let mut t = Task::new(TaskKey::from("x"), GroupKey::from("f-1"), Priority::new(0, 0, 0));
        t.restrictions.worker = Some(std::collections::BTreeSet::from([WorkerAddr::from("tcp://nope:1")]));
        store.tasks.insert(t.key.clone(), t);
        assert_eq!(decide_worker(&mut store, &TaskKey::from("x")), None);
    }

    #[test]
    fn loose_restriction_falls_back_to_any_worker_when_pool_empty() {
        let mut store = store_with_workers(1);
        let mut t = Task::new(TaskKey::from("x"), GroupKey::from("f-1"), Priority::new(0, 0, 0));
        t.restrictions.worker = Some(std::collections::BTreeSet::from([WorkerAddr::from("tcp://nope:1")]));
        t.restrictions.mode = Some(RestrictionMode::Loose);
        store.tasks.insert(t.key.clone(), t);
        assert!(decide_worker(&mut store, &TaskKey::from("x")).is_some());
    }

    #[test]
    fn root_task_colocation_sticks_to_one_worker() {
        let mut store = store_with_workers(2);
        let group_key = GroupKey::from("f-1");
        let mut group = TaskGroup::new(group_key.clone(), PrefixKey::from("f"));
        for _ in 0..20 {
            group.add(crate::task::TaskState::Released);
        }
        store.groups.insert(group_key.clone(), group);
        for i in 0..20 {
            let t = Task::new(TaskKey::from(format!("f-{i}").as_str()), group_key.clone(), Priority::new(0, 0, i));
            store.tasks.insert(t.key.clone(), t);
        }
        let first = decide_worker(&mut store, &TaskKey::from("f-0")).unwrap();
        let second = decide_worker(&mut store, &TaskKey::from("f-1")).unwrap();
        assert_eq!(first, second);
    }
}
