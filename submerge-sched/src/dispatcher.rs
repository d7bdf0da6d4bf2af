//! Turns one inbound stimulus into the right store mutation plus
//! transition cascade, and returns the resulting outbound batch. This is
//! the seam where the single-threaded executor model in the design notes
//! is enforced: every function here runs to completion, touching no I/O,
//! before the caller flushes its `OutboundBatch`.

use crate::ids::{PrefixKey, StimulusId, TaskKey, Timestamp, WorkerAddr};
use crate::messages::{OutboundBatch, WorkerInbound};
use crate::plugin::PluginRegistry;
use crate::policy;
use crate::store::Store;
use crate::task::TaskState;
use crate::transition::{transition_with_args, transitions, Recommendations, TransitionArgs, TransitionContext};

pub fn handle_worker_message(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    msg: WorkerInbound,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    match msg {
        WorkerInbound::TaskFinished { key, worker, nbytes, typename, start, stop } => {
            task_finished(store, plugins, key, worker, nbytes, typename, start, stop, now, stimulus_id)
        }
        WorkerInbound::TaskErred { key, worker, exception, traceback, cause } => {
            task_erred(store, plugins, key, worker, exception, traceback, cause, now, stimulus_id)
        }
        WorkerInbound::ReleaseWorkerData { key, worker } => {
            store.remove_replica(&key, &worker);
            let mut recs = Recommendations::new();
            if store.tasks.get(&key).map(|t| t.who_has.is_empty()).unwrap_or(false) {
                recs.push(key, TaskState::Released);
            }
            let mut ctx = TransitionContext { store, plugins, stimulus_id, now };
            transitions(&mut ctx, recs)
        }
        WorkerInbound::AddKeys { worker, keys } => {
            for key in keys {
                store.add_replica(&key, &worker);
            }
            OutboundBatch::default()
        }
        WorkerInbound::MissingData { key, errant_worker } => {
            store.remove_replica(&key, &errant_worker);
            let mut recs = Recommendations::new();
            if store.tasks.get(&key).map(|t| t.who_has.is_empty()).unwrap_or(false) {
                recs.push(key, TaskState::Released);
            }
            let mut ctx = TransitionContext { store, plugins, stimulus_id, now };
            transitions(&mut ctx, recs)
        }
        WorkerInbound::LongRunning { key, worker, compute_duration } => {
            if let Some(w) = store.workers.get_mut(&worker) {
                w.long_running.insert(key.clone());
                w.executing.insert(key, compute_duration);
                let old = w.occupancy;
                w.recompute_occupancy();
                let new = w.occupancy;
                store.total_occupancy += new - old;
            }
            store.recompute_idle_saturated(&worker);
            OutboundBatch::default()
        }
        WorkerInbound::Reschedule { key, worker } => {
            let mut recs = Recommendations::new();
            if store.tasks.get(&key).map(|t| t.processing_on.as_ref()) == Some(Some(&worker)) {
                recs.push(key, TaskState::Released);
            }
            let mut ctx = TransitionContext { store, plugins, stimulus_id, now };
            transitions(&mut ctx, recs)
        }
        WorkerInbound::KeepAlive => OutboundBatch::default(),
        WorkerInbound::WorkerStatusChange { worker, status } => {
            if let Some(w) = store.workers.get_mut(&worker) {
                w.status = match status.as_str() {
                    "running" => crate::worker::WorkerStatus::Running,
                    "paused" => crate::worker::WorkerStatus::Paused,
                    "closing_gracefully" => crate::worker::WorkerStatus::ClosingGracefully,
                    "closed" => crate::worker::WorkerStatus::Closed,
                    _ => w.status,
                };
            }
            match status.as_str() {
                "running" => {
                    store.running.insert(worker.clone());
                    store.idle.insert(worker);
                }
                _ => {
                    store.running.remove(&worker);
                    store.idle.remove(&worker);
                }
            }
            OutboundBatch::default()
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn task_finished(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    key: TaskKey,
    worker: WorkerAddr,
    nbytes: Option<i64>,
    typename: Option<String>,
    start: f64,
    stop: f64,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    if let Some(group_key) = store.tasks.get(&key).map(|t| t.group_key.clone()) {
        if let Some(prefix) = store.groups.get(&group_key).map(|g| g.prefix.clone()) {
            store.ensure_prefix(&prefix);
            let was_unknown = store.prefixes.get(&prefix).and_then(|p| p.duration_average).is_none();
            if let Some(p) = store.prefixes.get_mut(&prefix) {
                p.add_duration("compute", (stop - start).max(0.0));
            }
            if was_unknown {
                revise_parked_estimates(store, &prefix, &key);
            }
        }
        if let Some(g) = store.groups.get_mut(&group_key) {
            g.duration += (stop - start).max(0.0);
        }
    }

    let args = TransitionArgs { worker: Some(worker), nbytes, typename, ..Default::default() };
    run_transition_with_args(store, plugins, key, TaskState::Memory, args, now, stimulus_id)
}

/// Re-estimates every task parked against `prefix` now that its first real
/// observation has landed, updating the assigned worker's `processing` cost
/// and occupancy. `finished_key` is excluded -- it is about to leave
/// `processing` entirely via its own transition.
fn revise_parked_estimates(store: &mut Store, prefix: &PrefixKey, finished_key: &TaskKey) {
    for parked in store.take_unknown_durations(prefix) {
        if &parked == finished_key {
            continue;
        }
        let Some(worker) = store.tasks.get(&parked).and_then(|t| t.processing_on.clone()) else { continue };
        let new_duration = policy::estimate_duration(store, &parked, &worker);
        let old_occ = store.workers.get(&worker).map(|w| w.occupancy).unwrap_or(0.0);
        if let Some(w) = store.workers.get_mut(&worker) {
            w.processing.insert(parked.clone(), new_duration);
        }
        store.reconcile_worker_occupancy(&worker, old_occ);
    }
}

#[allow(clippy::too_many_arguments)]
fn task_erred(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    key: TaskKey,
    worker: WorkerAddr,
    exception: String,
    traceback: String,
    cause: Option<TaskKey>,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    let args = TransitionArgs {
        worker: Some(worker),
        exception: Some(exception),
        traceback: Some(traceback),
        cause,
        ..Default::default()
    };
    run_transition_with_args(store, plugins, key, TaskState::Erred, args, now, stimulus_id)
}

/// `transition()` in `transition.rs` takes no arguments because most edges
/// need none; the handful that do (memory/erred completions) thread them
/// through here instead of widening the common-case call signature.
fn run_transition_with_args(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    key: TaskKey,
    finish: TaskState,
    args: TransitionArgs,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    let mut ctx = TransitionContext { store, plugins, stimulus_id, now };
    let (recs, mut batch) = transition_with_args(&mut ctx, &key, finish, args);
    let more = transitions(&mut ctx, recs);
    batch.merge(more);
    batch
}
