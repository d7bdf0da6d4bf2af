//! Graph ingestion: turning a client's flattened task graph into `Task`
//! objects and the `waiting`/`erred` recommendations that start them
//! moving.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::client::ClientState;
use crate::computation::Computation;
use crate::ids::{ClientId, GroupKey, PrefixKey, Priority, StimulusId, TaskKey, Timestamp};
use crate::messages::{ClientOutbound, OutboundBatch};
use crate::plugin::PluginRegistry;
use crate::store::Store;
use crate::task::{Restrictions, Task, TaskState};
use crate::transition::{transitions, Recommendations, TransitionContext};

#[derive(Clone, Debug, Default)]
pub struct TaskAnnotations {
    pub priority: Option<i64>,
    pub restrictions: Restrictions,
    pub retries: u32,
    pub actor: bool,
}

#[derive(Clone, Debug)]
pub struct GraphSubmission {
    pub tasks: BTreeMap<TaskKey, Vec<u8>>,
    pub dependencies: BTreeMap<TaskKey, BTreeSet<TaskKey>>,
    pub keys: Vec<TaskKey>,
    pub client: ClientId,
    pub user_priority: i64,
    pub annotations: BTreeMap<TaskKey, TaskAnnotations>,
    pub fifo_timeout: f64,
    pub code: Vec<String>,
}

fn prefix_of(key: &TaskKey) -> PrefixKey {
    let head = key.0.split(['-', '(']).next().unwrap_or(&key.0);
    PrefixKey(head.to_string())
}

/// Derives the cohort a key belongs to by stripping a trailing partition
/// index, the way `key_split_group` keeps a graph's hash token but drops
/// the per-task counter -- so `root-0` .. `root-99` share one `TaskGroup`
/// instead of each becoming a singleton the root-task heuristic can never
/// see as large.
fn group_of(key: &TaskKey) -> GroupKey {
    if let Some(idx) = key.0.rfind('-') {
        let tail = &key.0[idx + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return GroupKey(key.0[..idx].to_string());
        }
    }
    GroupKey(key.0.clone())
}

/// Ingests a submitted graph: culls keys that depend on data no longer
/// reachable, prunes subgraph nodes whose result is already known, creates
/// new `Task`s, wires dependency edges, assigns priorities, applies
/// annotations, and emits `waiting`/`erred` recommendations for every
/// runnable root. Unknown keys referenced only in dependency lists of
/// tasks that were pruned are silently dropped, per the bad-input
/// propagation policy.
pub fn update_graph(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    mut submission: GraphSubmission,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    store.clients.entry(submission.client.clone()).or_insert_with(|| ClientState::new(submission.client.clone()));

    // A task whose own key appears in its own dependency set can never
    // satisfy `waiting_on ⊆ dependencies` becoming empty; treat it the
    // same as a trivial self-alias and drop it before it can deadlock.
    submission.tasks.retain(|k, _| !matches!(submission.dependencies.get(k), Some(d) if d.contains(k)));

    let mut batch = cull_unreachable_deps(store, &mut submission, &stimulus_id);
    prune_already_computed(store, &mut submission);

    if now.sub(store.last_submission_time) > submission.fifo_timeout {
        store.generation += 1;
    }
    store.last_submission_time = now;
    let generation = store.generation;

    let computation_groups_before: BTreeSet<GroupKey> = BTreeSet::new();
    let mut computation = Computation::new(now);
    computation.code = submission.code.clone();
    let _ = computation_groups_before;

    let mut recs = Recommendations::new();

    for (order, key) in submission.keys.iter().enumerate() {
        if store.tasks.contains_key(key) {
            continue;
        }
        let Some(run_spec) = submission.tasks.get(key) else { continue };

        let annotation = submission.annotations.get(key).cloned().unwrap_or_default();
        let priority = Priority::new(
            annotation.priority.unwrap_or(submission.user_priority),
            generation,
            order as i64,
        );

        let group_key = group_of(key);
        let prefix_key = prefix_of(key);
        store.ensure_group(&group_key, &prefix_key);
        computation.groups.insert(group_key.clone());

        let mut task = Task::new(key.clone(), group_key.clone(), priority);
        task.run_spec = Some(run_spec.clone());
        // Restrictions default to strict: a key only becomes loose when the
        // caller names it in the submission's loose-restrictions list, which
        // shows up here as an explicit `mode` on the annotation.
        task.restrictions = annotation.restrictions;
        task.retries = annotation.retries;
        task.actor = annotation.actor;

        if let Some(deps) = submission.dependencies.get(key) {
            task.dependencies = deps.clone();
        }

        store.tasks.insert(key.clone(), task);
        if let Some(g) = store.groups.get_mut(&group_key) {
            g.add(TaskState::Released);
        }
    }

    for (key, deps) in &submission.dependencies {
        for dep in deps {
            if let Some(dep_task) = store.tasks.get_mut(dep) {
                dep_task.dependents.insert(key.clone());
            }
            if let Some(group_key) = store.tasks.get(key).map(|t| t.group_key.clone()) {
                if let Some(dep_group) = store.tasks.get(dep).map(|t| t.group_key.clone()) {
                    if dep_group != group_key {
                        if let Some(g) = store.groups.get_mut(&group_key) {
                            g.dependencies.insert(dep_group);
                        }
                    }
                }
            }
        }
    }

    for key in &submission.keys {
        if let Some(t) = store.tasks.get_mut(key) {
            t.who_wants.insert(submission.client.clone());
        }
    }
    if let Some(c) = store.clients.get_mut(&submission.client) {
        c.wants_what.extend(submission.keys.iter().cloned());
    }

    if !computation.groups.is_empty() {
        store.computations.push_back(computation);
        while store.computations.len() > store.config.computations_max_history {
            store.computations.pop_front();
        }
    }

    for key in &submission.keys {
        if store.tasks.get(key).map(|t| t.state) == Some(TaskState::Released) {
            recs.push(key.clone(), TaskState::Waiting);
        }
    }

    let mut ctx = TransitionContext { store, plugins: &mut *plugins, stimulus_id: stimulus_id.clone(), now };
    batch.merge(transitions(&mut ctx, recs));
    plugins.notify_update_graph(&stimulus_id);
    batch
}

/// Cancels any key whose dependency graph transitively references data
/// that no longer exists anywhere -- neither already in the store nor
/// present in this same submission -- reporting `cancelled-key` to the
/// submitting client for each one. Runs to a fixed point since removing
/// one bad key can make a key that depended on it newly unreachable.
fn cull_unreachable_deps(store: &Store, submission: &mut GraphSubmission, stimulus_id: &StimulusId) -> OutboundBatch {
    let mut batch = OutboundBatch::default();
    loop {
        let bad_keys: Vec<TaskKey> = submission
            .dependencies
            .iter()
            .filter(|(k, deps)| {
                submission.tasks.contains_key(k)
                    && deps.iter().any(|d| !store.tasks.contains_key(d) && !submission.tasks.contains_key(d))
            })
            .map(|(k, _)| k.clone())
            .collect();
        if bad_keys.is_empty() {
            break;
        }
        for k in bad_keys {
            info!(target: "submerge_sched", key = %k, stimulus_id = %stimulus_id, "user asked for computation on lost data");
            submission.tasks.remove(&k);
            submission.dependencies.remove(&k);
            submission.keys.retain(|x| x != &k);
            batch.to_clients.push((submission.client.clone(), ClientOutbound::CancelledKey { key: k }));
        }
    }
    batch
}

/// Avoids recomputing subgraph nodes whose result is already known: any
/// key already `memory`/`erred` in the store seeds a backward walk that
/// drops every dependency feeding *only* into already-done nodes from the
/// incoming submission, since those nodes would be created (and never
/// run) for no purpose.
fn prune_already_computed(store: &Store, submission: &mut GraphSubmission) {
    let mut done: BTreeSet<TaskKey> = submission
        .dependencies
        .iter()
        .filter(|(k, deps)| !deps.is_empty() && matches!(store.tasks.get(k).map(|t| t.state), Some(TaskState::Memory) | Some(TaskState::Erred)))
        .map(|(k, _)| k.clone())
        .collect();
    if done.is_empty() {
        return;
    }

    let mut dependents: BTreeMap<TaskKey, BTreeSet<TaskKey>> = BTreeMap::new();
    for (k, deps) in &submission.dependencies {
        for d in deps {
            dependents.entry(d.clone()).or_default().insert(k.clone());
        }
    }

    let mut stack: Vec<TaskKey> = done.iter().cloned().collect();
    while let Some(key) = stack.pop() {
        let deps = submission
            .dependencies
            .get(&key)
            .cloned()
            .or_else(|| store.tasks.get(&key).map(|t| t.dependencies.clone()))
            .unwrap_or_default();
        for dep in deps {
            let child_deps = dependents
                .get(&dep)
                .cloned()
                .or_else(|| store.tasks.get(&dep).map(|t| t.dependents.clone()))
                .unwrap_or_default();
            if !child_deps.is_empty() && child_deps.iter().all(|d| done.contains(d)) && !done.contains(&dep) {
                done.insert(dep.clone());
                stack.push(dep);
            }
        }
    }

    for d in &done {
        submission.tasks.remove(d);
        submission.dependencies.remove(d);
    }
}
