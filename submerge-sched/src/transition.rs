//! The state machine: fifteen direct edges between the seven task states,
//! plus a compound `start -> released -> finish` fallback for any pair not
//! directly wired. `transition` executes exactly one edge and returns
//! further recommendations; `transitions` drains a recommendation map to a
//! fixed point. Handlers never perform I/O -- they only enqueue outbound
//! messages, which the caller flushes once the cascade settles.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::client::FIRE_AND_FORGET;
use crate::error::{InvariantViolation, Result};
use crate::ids::{ClientId, StimulusId, TaskKey, Timestamp, WorkerAddr};
use crate::messages::{ClientOutbound, OutboundBatch, WorkerOutbound};
use crate::plugin::PluginRegistry;
use crate::policy;
use crate::store::Store;
use crate::task::TaskState;

/// Tasks recommended for a state change, keyed so a later recommendation
/// for the same key in one drain pass overwrites an earlier one -- the
/// Python original's semantics, since a single cascade step may re-derive
/// a fresher recommendation for a key already queued.
#[derive(Clone, Debug, Default)]
pub struct Recommendations(pub BTreeMap<TaskKey, TaskState>);

impl Recommendations {
    pub fn new() -> Recommendations {
        Recommendations(BTreeMap::new())
    }

    pub fn push(&mut self, key: TaskKey, state: TaskState) {
        self.0.insert(key, state);
    }

    pub fn merge(&mut self, other: Recommendations) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TransitionArgs {
    pub worker: Option<WorkerAddr>,
    pub nbytes: Option<i64>,
    pub typename: Option<String>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub cause: Option<TaskKey>,
    pub run_spec: Option<Vec<u8>>,
}

pub struct TransitionContext<'a> {
    pub store: &'a mut Store,
    pub plugins: &'a mut PluginRegistry,
    pub stimulus_id: StimulusId,
    pub now: Timestamp,
}

/// Drains `recommendations` to a fixed point, accumulating one outbound
/// batch. Convergence holds because every edge either deletes a task or
/// strictly reduces a well-founded measure (waiting-on size, suspicious
/// count, or the number of live tasks) -- see the design notes.
pub fn transitions(ctx: &mut TransitionContext, mut recs: Recommendations) -> OutboundBatch {
    let mut batch = OutboundBatch::default();
    while let Some(key) = recs.0.keys().next().cloned() {
        let finish = recs.0.remove(&key).unwrap();
        let (more, msgs) = transition(ctx, &key, finish);
        recs.merge(more);
        batch.merge(msgs);
    }
    batch
}

/// Executes exactly one `(start, finish)` edge for `key`, notifies
/// plugins, and returns any recommendations and messages it produced.
pub fn transition(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    finish: TaskState,
) -> (Recommendations, OutboundBatch) {
    let args = TransitionArgs::default();
    transition_with_args(ctx, key, finish, args)
}

/// Like [`transition`] but for the handful of edges (memory/erred
/// completions) that need extra stimulus data -- the reporting worker,
/// the observed byte count, an exception. Exposed separately so the
/// common no-argument case isn't forced to thread through an always-empty
/// struct at every call site.
pub fn transition_with_args(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    finish: TaskState,
    args: TransitionArgs,
) -> (Recommendations, OutboundBatch) {
    let Some(start) = ctx.store.tasks.get(key).map(|t| t.state) else {
        return (Recommendations::new(), OutboundBatch::default());
    };
    if start == finish {
        return (Recommendations::new(), OutboundBatch::default());
    }

    let (recs, batch) = dispatch(ctx, key, start, finish, &args);

    if let Some(t) = ctx.store.tasks.get(key) {
        if t.state != start {
            ctx.store.log_transition(key.clone(), start, t.state, ctx.stimulus_id.clone(), ctx.now);
            ctx.plugins.notify_transition(key, start, t.state, &ctx.stimulus_id);
            debug!(target: "submerge_sched", key = %key, ?start, finish = ?t.state, "task transition");
        }
    }

    if ctx.store.config.validate {
        if let Err(e) = validate_task(ctx.store, key) {
            warn!(target: "submerge_sched", key = %key, error = %e, "invariant violated after transition");
        }
    }

    (recs, batch)
}

fn dispatch(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    start: TaskState,
    finish: TaskState,
    args: &TransitionArgs,
) -> (Recommendations, OutboundBatch) {
    use TaskState::*;
    match (start, finish) {
        (Released, Waiting) => released_to_waiting(ctx, key),
        (Released, Forgotten) => released_or_memory_to_forgotten(ctx, key),
        (Released, Erred) => released_to_erred(ctx, key, args),
        (Waiting, Processing) => waiting_to_processing(ctx, key),
        (Waiting, Released) => waiting_to_released(ctx, key),
        (Waiting, Memory) => waiting_to_memory(ctx, key, args),
        (Processing, Memory) => processing_to_memory(ctx, key, args),
        (Processing, Erred) => processing_to_erred(ctx, key, args),
        (Processing, Released) => processing_to_released(ctx, key),
        (NoWorker, Waiting) => no_worker_to_waiting(ctx, key),
        (NoWorker, Released) => set_state(ctx, key, Released),
        (NoWorker, Memory) => no_worker_to_memory(ctx, key, args),
        (Memory, Released) => memory_to_released(ctx, key),
        (Memory, Forgotten) => released_or_memory_to_forgotten(ctx, key),
        (Erred, Released) => erred_to_released(ctx, key),
        (s, f) if s != Released => compound(ctx, key, f),
        _ => (Recommendations::new(), OutboundBatch::default()),
    }
}

/// Any transition not directly wired is realised as `start -> released ->
/// finish`; rejected if `start == released` already (that would loop).
fn compound(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    finish: TaskState,
) -> (Recommendations, OutboundBatch) {
    let (mut recs1, mut batch1) = transition(ctx, key, TaskState::Released);
    let (recs2, batch2) = transition(ctx, key, finish);
    recs1.merge(recs2);
    batch1.merge(batch2);
    (recs1, batch1)
}

fn set_state(ctx: &mut TransitionContext, key: &TaskKey, state: TaskState) -> (Recommendations, OutboundBatch) {
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        let old = t.state;
        t.state = state;
        if let Some(g) = ctx.store.groups.get_mut(&t.group_key.clone()) {
            g.move_state(old, state);
        }
    }
    (Recommendations::new(), OutboundBatch::default())
}

fn move_group_state(store: &mut Store, key: &TaskKey, old: TaskState, new: TaskState) {
    let group_key = store.tasks.get(key).map(|t| t.group_key.clone());
    if let Some(gk) = group_key {
        if let Some(g) = store.groups.get_mut(&gk) {
            g.move_state(old, new);
        }
    }
}

// --- released -> waiting -------------------------------------------------

fn released_to_waiting(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();

    let (dependencies, has_run_spec) = match ctx.store.tasks.get(key) {
        Some(t) => (t.dependencies.clone(), t.run_spec.is_some()),
        None => return (recs, OutboundBatch::default()),
    };
    if !has_run_spec {
        warn!(target: "submerge_sched", key = %key, "released->waiting requested for task with no run-spec");
    }

    let mut waiting_on = std::collections::BTreeSet::new();
    let mut blame: Option<TaskKey> = None;
    let mut any_forgotten = false;

    for dep_key in &dependencies {
        let Some(dep) = ctx.store.tasks.get(dep_key) else {
            any_forgotten = true;
            continue;
        };
        if dep.state == TaskState::Forgotten {
            any_forgotten = true;
            continue;
        }
        if let Some(b) = &dep.exception_blame {
            blame = Some(b.clone());
            continue;
        }
        if dep.who_has.is_empty() {
            waiting_on.insert(dep_key.clone());
            if dep.state == TaskState::Released {
                recs.push(dep_key.clone(), TaskState::Waiting);
            }
        }
    }

    if any_forgotten {
        recs.push(key.clone(), TaskState::Forgotten);
        return (recs, OutboundBatch::default());
    }
    if let Some(b) = blame {
        if let Some(t) = ctx.store.tasks.get_mut(key) {
            t.exception_blame = Some(b);
        }
        recs.push(key.clone(), TaskState::Erred);
        return (recs, OutboundBatch::default());
    }

    for dep_key in &waiting_on {
        if let Some(dep) = ctx.store.tasks.get_mut(dep_key) {
            dep.waiters.insert(key.clone());
        }
    }

    let old = TaskState::Released;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.waiting_on = waiting_on.clone();
        t.state = TaskState::Waiting;
    }
    move_group_state(ctx.store, key, old, TaskState::Waiting);

    if waiting_on.is_empty() {
        if ctx.store.workers.is_empty() {
            recs.push(key.clone(), TaskState::NoWorker);
        } else {
            recs.push(key.clone(), TaskState::Processing);
        }
    }

    (recs, OutboundBatch::default())
}

// --- waiting -> processing ------------------------------------------------

fn waiting_to_processing(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let mut batch = OutboundBatch::default();
    let recs = Recommendations::new();

    let chosen = policy::decide_worker(ctx.store, key);
    let Some(worker_addr) = chosen else {
        return (recs, batch);
    };

    let (duration, who_has, nbytes, resources, actor, run_spec, priority, group_key) = {
        let Some(t) = ctx.store.tasks.get(key) else { return (recs, batch) };
        let duration = policy::estimate_duration(ctx.store, key, &worker_addr);
        let who_has: Vec<(TaskKey, Vec<WorkerAddr>)> = t
            .dependencies
            .iter()
            .filter_map(|d| ctx.store.tasks.get(d).map(|dt| (d.clone(), dt.who_has.iter().cloned().collect())))
            .collect();
        let nbytes = t.effective_nbytes(ctx.store.config.default_data_size);
        let resources: Vec<(String, u64)> =
            t.restrictions.resources.clone().map(|s| s.into_iter().collect()).unwrap_or_default();
        (
            duration,
            who_has,
            nbytes,
            resources,
            t.actor,
            t.run_spec.clone().unwrap_or_default(),
            t.priority,
            t.group_key.clone(),
        )
    };

    // If this prefix has never produced a real observation, the `duration`
    // above is a guess; park this task so it can be re-estimated the moment
    // the first real sample for the prefix lands (see `task_finished`).
    let prefix_key = ctx.store.groups.get(&group_key).map(|g| g.prefix.clone());
    if let Some(pk) = &prefix_key {
        let has_estimate = ctx.store.prefixes.get(pk).and_then(|p| p.duration_average).is_some();
        if !has_estimate {
            ctx.store.park_unknown_duration(pk, key);
        }
    }

    let old_occ = ctx.store.workers.get(&worker_addr).map(|w| w.occupancy).unwrap_or(0.0);
    if let Some(w) = ctx.store.workers.get_mut(&worker_addr) {
        w.processing.insert(key.clone(), duration);
        for (res, qty) in &resources {
            *w.used_resources.entry(res.clone()).or_insert(0) += qty;
        }
    }
    ctx.store.reconcile_worker_occupancy(&worker_addr, old_occ);
    ctx.store.n_tasks += 1;

    let old = TaskState::Waiting;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.state = TaskState::Processing;
        t.processing_on = Some(worker_addr.clone());
    }
    move_group_state(ctx.store, key, old, TaskState::Processing);
    if let Some(g) = ctx.store.groups.get_mut(&group_key) {
        g.last_worker = Some(worker_addr.clone());
    }

    batch.to_workers.push((
        worker_addr,
        WorkerOutbound::ComputeTask {
            key: key.clone(),
            priority,
            duration,
            who_has,
            nbytes,
            resource_restrictions: resources,
            actor,
            run_spec,
            stimulus_id: ctx.stimulus_id.clone(),
        },
    ));

    (recs, batch)
}

fn waiting_to_released(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let waiting_on = ctx.store.tasks.get(key).map(|t| t.waiting_on.clone()).unwrap_or_default();
    for dep in &waiting_on {
        if let Some(dep_task) = ctx.store.tasks.get_mut(dep) {
            dep_task.waiters.remove(key);
        }
    }
    let old = TaskState::Waiting;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.waiting_on.clear();
        t.state = TaskState::Released;
    }
    move_group_state(ctx.store, key, old, TaskState::Released);
    (Recommendations::new(), OutboundBatch::default())
}

fn waiting_to_memory(ctx: &mut TransitionContext, key: &TaskKey, args: &TransitionArgs) -> (Recommendations, OutboundBatch) {
    // A client may insert pre-computed data directly; treat like a
    // processing->memory completion with no worker transfer cost.
    accept_memory(ctx, key, args, TaskState::Waiting)
}

fn no_worker_to_waiting(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();
    let old = TaskState::NoWorker;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.state = TaskState::Waiting;
    }
    move_group_state(ctx.store, key, old, TaskState::Waiting);
    if ctx.store.workers.is_empty() {
        recs.push(key.clone(), TaskState::NoWorker);
    } else {
        recs.push(key.clone(), TaskState::Processing);
    }
    (recs, OutboundBatch::default())
}

fn no_worker_to_memory(ctx: &mut TransitionContext, key: &TaskKey, args: &TransitionArgs) -> (Recommendations, OutboundBatch) {
    warn!(target: "submerge_sched", key = %key, "worker reported memory for a task parked as no-worker");
    accept_memory(ctx, key, args, TaskState::NoWorker)
}

// --- processing -> memory --------------------------------------------------

fn processing_to_memory(ctx: &mut TransitionContext, key: &TaskKey, args: &TransitionArgs) -> (Recommendations, OutboundBatch) {
    let mut batch = OutboundBatch::default();
    let expected_worker = ctx.store.tasks.get(key).and_then(|t| t.processing_on.clone());

    if let (Some(reporting), Some(expected)) = (&args.worker, &expected_worker) {
        if reporting != expected {
            batch.to_workers.push((
                expected.clone(),
                WorkerOutbound::CancelCompute { key: key.clone(), stimulus_id: ctx.stimulus_id.clone() },
            ));
        }
    }

    if let Some(worker) = expected_worker.clone() {
        remove_from_processing(ctx.store, key, &worker);
    }

    let (recs, more_batch) = accept_memory(ctx, key, args, TaskState::Processing);
    batch.merge(more_batch);
    (recs, batch)
}

fn processing_to_erred(ctx: &mut TransitionContext, key: &TaskKey, args: &TransitionArgs) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();

    if let Some(worker) = ctx.store.tasks.get(key).and_then(|t| t.processing_on.clone()) {
        remove_from_processing(ctx.store, key, &worker);
    }

    let retries = ctx.store.tasks.get(key).map(|t| t.retries).unwrap_or(0);
    if retries > 0 {
        if let Some(t) = ctx.store.tasks.get_mut(key) {
            t.retries -= 1;
        }
        recs.push(key.clone(), TaskState::Waiting);
        return (recs, OutboundBatch::default());
    }

    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.exception = args.exception.clone();
        t.traceback = args.traceback.clone();
        t.exception_blame = Some(key.clone());
        let old = t.state;
        t.state = TaskState::Erred;
        let gk = t.group_key.clone();
        if let Some(g) = ctx.store.groups.get_mut(&gk) {
            g.move_state(old, TaskState::Erred);
        }
    }

    propagate_blame(ctx.store, key, &mut recs);

    let mut batch = OutboundBatch::default();
    let (who_wants, exc, tb) = ctx
        .store
        .tasks
        .get(key)
        .map(|t| {
            (
                t.who_wants.clone(),
                t.exception.clone().unwrap_or_default(),
                t.traceback.clone().unwrap_or_default(),
            )
        })
        .unwrap_or_default();
    for client in who_wants {
        batch.to_clients.push((
            client,
            ClientOutbound::TaskErred { key: key.clone(), exception: exc.clone(), traceback: tb.clone() },
        ));
    }

    (recs, batch)
}

fn processing_to_released(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    if let Some(worker) = ctx.store.tasks.get(key).and_then(|t| t.processing_on.clone()) {
        remove_from_processing(ctx.store, key, &worker);
    }
    let old = TaskState::Processing;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.processing_on = None;
        t.state = TaskState::Released;
    }
    move_group_state(ctx.store, key, old, TaskState::Released);
    (Recommendations::new(), OutboundBatch::default())
}

fn remove_from_processing(store: &mut Store, key: &TaskKey, worker: &WorkerAddr) {
    let old_occ = store.workers.get(worker).map(|w| w.occupancy).unwrap_or(0.0);
    if let Some(w) = store.workers.get_mut(worker) {
        w.processing.remove(key);
        w.long_running.remove(key);
        w.executing.remove(key);
    }
    store.reconcile_worker_occupancy(worker, old_occ);
}

fn accept_memory(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    args: &TransitionArgs,
    start: TaskState,
) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();
    let mut batch = OutboundBatch::default();

    if let Some(nbytes) = args.nbytes {
        if let Some(t) = ctx.store.tasks.get_mut(key) {
            t.nbytes = nbytes;
        }
    }

    let worker = args.worker.clone();
    if let Some(w) = &worker {
        ctx.store.add_replica(key, w);
    }

    let (group_key, has_who_has) = match ctx.store.tasks.get_mut(key) {
        Some(t) => {
            t.processing_on = None;
            t.state = TaskState::Memory;
            (t.group_key.clone(), !t.who_has.is_empty())
        }
        None => return (recs, batch),
    };
    if !has_who_has {
        warn!(target: "submerge_sched", key = %key, "transitioned to memory with no replica recorded");
    }
    if let Some(g) = ctx.store.groups.get_mut(&group_key) {
        g.move_state(start, TaskState::Memory);
    }

    let waiters = ctx.store.tasks.get(key).map(|t| t.waiters.clone()).unwrap_or_default();
    for w in &waiters {
        if ctx.store.tasks.get(w).map(|t| t.state) == Some(TaskState::Waiting) {
            if let Some(t) = ctx.store.tasks.get_mut(w) {
                t.waiting_on.remove(key);
                if t.waiting_on.is_empty() {
                    recs.push(w.clone(), TaskState::Processing);
                }
            }
        }
    }

    let who_wants = ctx.store.tasks.get(key).map(|t| t.who_wants.clone()).unwrap_or_default();
    let typename = args.typename.clone();
    for client in who_wants {
        batch.to_clients.push((
            client,
            ClientOutbound::KeyInMemory { key: key.clone(), typename: typename.clone() },
        ));
    }

    (recs, batch)
}

// --- releasing memory -------------------------------------------------------

fn memory_to_released(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();
    let mut batch = OutboundBatch::default();

    let holders = ctx.store.clear_replicas(key);
    for h in holders {
        batch
            .to_workers
            .push((h, WorkerOutbound::FreeKeys { keys: vec![key.clone()], stimulus_id: ctx.stimulus_id.clone() }));
    }

    let (waiters, who_wants, is_pure_data, has_lost_deps, group_key) = match ctx.store.tasks.get_mut(key) {
        Some(t) => {
            t.state = TaskState::Released;
            (t.waiters.clone(), t.who_wants.clone(), t.is_pure_data(), t.has_lost_dependencies, t.group_key.clone())
        }
        None => return (recs, batch),
    };
    if let Some(g) = ctx.store.groups.get_mut(&group_key) {
        g.move_state(TaskState::Memory, TaskState::Released);
    }

    for w in &waiters {
        recs.push(w.clone(), TaskState::Waiting);
    }
    for client in who_wants {
        batch.to_clients.push((client, ClientOutbound::LostData { key: key.clone() }));
    }

    if is_pure_data || has_lost_deps {
        recs.push(key.clone(), TaskState::Forgotten);
    }

    (recs, batch)
}

fn erred_to_released(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let old = TaskState::Erred;
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        t.exception = None;
        t.traceback = None;
        t.exception_blame = None;
        t.state = TaskState::Released;
    }
    move_group_state(ctx.store, key, old, TaskState::Released);
    (Recommendations::new(), OutboundBatch::default())
}

fn released_to_erred(
    ctx: &mut TransitionContext,
    key: &TaskKey,
    args: &TransitionArgs,
) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();
    let old = TaskState::Released;

    // A task can arrive here already blaming a failed dependency (see
    // `released_to_waiting`'s blame-inheritance branch); don't clobber that
    // with self-blame, or the dependent's `who_wants` clients get told the
    // wrong exception.
    let inherited_blame = ctx.store.tasks.get(key).and_then(|t| t.exception_blame.clone());
    if let Some(t) = ctx.store.tasks.get_mut(key) {
        if inherited_blame.is_none() {
            t.exception = args.exception.clone();
            t.traceback = args.traceback.clone();
            t.exception_blame = Some(key.clone());
        }
        t.state = TaskState::Erred;
    }
    move_group_state(ctx.store, key, old, TaskState::Erred);
    propagate_blame(ctx.store, key, &mut recs);

    let mut batch = OutboundBatch::default();
    let who_wants = ctx.store.tasks.get(key).map(|t| t.who_wants.clone()).unwrap_or_default();
    let blame_key = ctx.store.tasks.get(key).and_then(|t| t.exception_blame.clone()).unwrap_or_else(|| key.clone());
    let (exc, tb) = ctx
        .store
        .tasks
        .get(&blame_key)
        .map(|b| (b.exception.clone().unwrap_or_default(), b.traceback.clone().unwrap_or_default()))
        .unwrap_or_default();
    for client in who_wants {
        batch.to_clients.push((
            client,
            ClientOutbound::TaskErred { key: key.clone(), exception: exc.clone(), traceback: tb.clone() },
        ));
    }

    (recs, batch)
}

fn propagate_blame(store: &mut Store, key: &TaskKey, recs: &mut Recommendations) {
    let dependents = store.tasks.get(key).map(|t| t.dependents.clone()).unwrap_or_default();
    for dep_key in dependents {
        if let Some(dep) = store.tasks.get_mut(&dep_key) {
            if dep.state != TaskState::Memory && dep.state != TaskState::Erred {
                dep.exception_blame = Some(key.clone());
                recs.push(dep_key, TaskState::Erred);
            }
        }
    }
}

// --- forgetting --------------------------------------------------------------

fn released_or_memory_to_forgotten(ctx: &mut TransitionContext, key: &TaskKey) -> (Recommendations, OutboundBatch) {
    let mut recs = Recommendations::new();
    let mut batch = OutboundBatch::default();

    let holders = ctx.store.clear_replicas(key);
    if !holders.is_empty() {
        for h in holders {
            batch
                .to_workers
                .push((h, WorkerOutbound::FreeKeys { keys: vec![key.clone()], stimulus_id: ctx.stimulus_id.clone() }));
        }
    }

    let Some(task) = ctx.store.tasks.get(key).cloned() else {
        return (recs, batch);
    };

    for dep_key in &task.dependents {
        if let Some(dep) = ctx.store.tasks.get_mut(dep_key) {
            dep.has_lost_dependencies = true;
            dep.dependencies.remove(key);
            if dep.state != TaskState::Memory && dep.state != TaskState::Erred {
                recs.push(dep_key.clone(), TaskState::Forgotten);
            }
        }
    }
    for dep_key in &task.dependencies {
        if let Some(dep) = ctx.store.tasks.get_mut(dep_key) {
            dep.dependents.remove(key);
            dep.waiters.remove(key);
        }
    }

    for client in &task.who_wants {
        batch.to_clients.push((client.clone(), ClientOutbound::CancelledKey { key: key.clone() }));
    }

    let group_key = task.group_key.clone();
    ctx.store.tasks.remove(key);
    if let Some(g) = ctx.store.groups.get_mut(&group_key) {
        g.move_state(task.state, TaskState::Forgotten);
        if g.is_empty() {
            ctx.store.groups.remove(&group_key);
        }
    }

    (recs, batch)
}

fn validate_task(store: &Store, key: &TaskKey) -> Result<()> {
    let Some(t) = store.tasks.get(key) else { return Ok(()) };
    if (t.state == TaskState::Memory) != !t.who_has.is_empty() {
        return Err(InvariantViolation::new(key.0.clone(), "memory state disagrees with who_has").into_error());
    }
    if (t.state == TaskState::Processing) != t.processing_on.is_some() {
        return Err(InvariantViolation::new(key.0.clone(), "processing state disagrees with processing_on")
            .into_error());
    }
    for w in &t.who_has {
        if let Some(worker) = store.workers.get(w) {
            if !worker.has_what.contains(key) {
                return Err(InvariantViolation::new(key.0.clone(), "who_has/has_what out of sync").into_error());
            }
        }
    }
    for d in &t.waiting_on {
        if !t.dependencies.contains(d) {
            return Err(InvariantViolation::new(key.0.clone(), "waiting_on not subset of dependencies").into_error());
        }
    }
    Ok(())
}

/// Acquires the synthetic fire-and-forget client's interest in `key` so it
/// survives beyond the submitting client's disconnect.
pub fn mark_fire_and_forget(store: &mut Store, key: &TaskKey) {
    let client_id = ClientId::from(FIRE_AND_FORGET);
    if let Some(t) = store.tasks.get_mut(key) {
        t.who_wants.insert(client_id.clone());
    }
    if let Some(c) = store.clients.get_mut(&client_id) {
        c.wants_what.insert(key.clone());
    }
}
