//! Worker and client lifecycle: registration, removal, heartbeats, TTL
//! expiry, graceful retirement, and restart coordination.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::client::ClientState;
use crate::error::{err, Result};
use crate::ids::{ClientId, StimulusId, Timestamp, WorkerAddr};
use crate::messages::{ClientOutbound, OutboundBatch, WorkerOutbound};
use crate::plugin::PluginRegistry;
use crate::store::Store;
use crate::task::TaskState;
use crate::transition::{transitions, Recommendations, TransitionContext};
use crate::worker::{WorkerState, WorkerStatus};

pub fn add_worker(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    address: WorkerAddr,
    host: String,
    nthreads: u32,
    memory_limit: i64,
    already_in_memory: Vec<crate::ids::TaskKey>,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> Result<OutboundBatch> {
    if store.workers.contains_key(&address) {
        return Err(err(format!("duplicate worker address: {address}")));
    }

    let mut w = WorkerState::new(address.clone(), host, nthreads, memory_limit);
    w.status = WorkerStatus::Running;
    w.last_seen = now;
    store.total_nthreads += nthreads;
    store.workers.insert(address.clone(), w);
    store.running.insert(address.clone());
    store.idle.insert(address.clone());

    for key in &already_in_memory {
        store.add_replica(key, &address);
    }

    let mut recs = Recommendations::new();
    let no_worker_keys: Vec<_> = store
        .tasks
        .iter()
        .filter(|(_, t)| t.state == TaskState::NoWorker)
        .map(|(k, _)| k.clone())
        .collect();
    for key in no_worker_keys {
        let eligible = crate::policy::valid_workers(store, &key).map(|v| v.contains(&address)).unwrap_or(true);
        if eligible {
            recs.push(key, TaskState::Waiting);
        }
    }

    let mut ctx = TransitionContext { store, plugins: &mut *plugins, stimulus_id, now };
    let batch = transitions(&mut ctx, recs);
    plugins.notify_add_worker(&address);
    info!(target: "submerge_sched", worker = %address, "worker added");
    Ok(batch)
}

pub fn remove_worker(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    address: &WorkerAddr,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    let Some(w) = store.workers.get(address).cloned() else {
        return OutboundBatch::default();
    };

    store.running.remove(address);
    store.idle.remove(address);
    store.saturated.remove(address);
    store.total_nthreads = store.total_nthreads.saturating_sub(w.nthreads);
    store.total_occupancy -= w.occupancy;

    let mut recs = Recommendations::new();
    for (key, _) in &w.processing {
        if let Some(t) = store.tasks.get_mut(key) {
            t.suspicious += 1;
            t.processing_on = None;
            if t.suspicious > store.config.allowed_failures {
                t.exception = Some("killed worker".to_string());
                t.exception_blame = Some(key.clone());
                recs.push(key.clone(), TaskState::Erred);
            } else {
                recs.push(key.clone(), TaskState::Released);
            }
        }
    }

    for key in w.has_what.iter() {
        store.remove_replica(key, address);
        if store.tasks.get(key).map(|t| t.who_has.is_empty()).unwrap_or(false) {
            recs.push(key.clone(), TaskState::Released);
        }
    }

    store.workers.remove(address);

    let mut ctx = TransitionContext { store, plugins: &mut *plugins, stimulus_id, now };
    let batch = transitions(&mut ctx, recs);
    plugins.notify_remove_worker(address);
    warn!(target: "submerge_sched", worker = %address, "worker removed");
    batch
}

pub fn heartbeat_worker(
    store: &mut Store,
    address: &WorkerAddr,
    now: Timestamp,
    process_memory: Option<i64>,
    clock_delay: f64,
) {
    let Some(w) = store.workers.get_mut(address) else { return };
    w.last_seen = now;
    w.clock_delay = clock_delay;
    if let Some(rss) = process_memory {
        let bound = (store.config.memory_recent_to_old_time / 0.5).max(2.0) as usize;
        w.push_memory_sample(now, rss, bound.max(1));
    }
}

/// Removes any worker not heard from within `max(worker_ttl,
/// 10*heartbeat_interval)` seconds.
pub fn expire_stale_workers(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    let interval = crate::messages::heartbeat_interval(store.workers.len());
    let ttl = store.config.worker_ttl.max(10.0 * interval);
    let stale: Vec<WorkerAddr> = store
        .workers
        .iter()
        .filter(|(_, w)| now.sub(w.last_seen) > ttl)
        .map(|(addr, _)| addr.clone())
        .collect();

    let mut batch = OutboundBatch::default();
    for addr in stale {
        batch.merge(remove_worker(store, plugins, &addr, now, stimulus_id.clone()));
    }
    batch
}

pub fn add_client(store: &mut Store, plugins: &mut PluginRegistry, client: ClientId, now: Timestamp) {
    let notify = client.clone();
    store.clients.entry(client.clone()).or_insert_with(|| {
        let mut c = ClientState::new(client);
        c.last_seen = now;
        c
    });
    plugins.notify_add_client(&notify);
}

pub fn remove_client(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    client: &ClientId,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> OutboundBatch {
    let Some(c) = store.clients.remove(client) else {
        return OutboundBatch::default();
    };

    let mut recs = Recommendations::new();
    for key in &c.wants_what {
        if let Some(t) = store.tasks.get_mut(key) {
            t.who_wants.remove(client);
            if t.who_wants.is_empty() && t.state == TaskState::Memory {
                recs.push(key.clone(), TaskState::Released);
            }
        }
    }

    let mut ctx = TransitionContext { store, plugins: &mut *plugins, stimulus_id, now };
    let batch = transitions(&mut ctx, recs);
    plugins.notify_remove_client(client);
    batch
}

/// Retires a worker: stops scheduling new tasks onto it, ensures every
/// uniquely-held replica gets a second home elsewhere, then removes it.
/// Aborts (leaving the worker's status unchanged) if any remaining key has
/// no other valid recipient.
pub fn retire_worker(
    store: &mut Store,
    plugins: &mut PluginRegistry,
    address: &WorkerAddr,
    now: Timestamp,
    stimulus_id: StimulusId,
) -> Result<OutboundBatch> {
    let Some(w) = store.workers.get(address).cloned() else {
        return Ok(OutboundBatch::default());
    };

    let others: Vec<WorkerAddr> = store.workers.keys().filter(|a| *a != address).cloned().collect();
    if others.is_empty() && !w.has_what.is_empty() {
        return Err(err(format!("cannot retire {address}: no other worker to hold its replicas")));
    }

    if let Some(worker) = store.workers.get_mut(address) {
        worker.status = WorkerStatus::ClosingGracefully;
    }
    store.running.remove(address);
    store.idle.remove(address);

    let mut batch = OutboundBatch::default();
    let keys_to_copy: Vec<_> = w.has_what.iter().cloned().collect();
    let mut remove_keys = BTreeSet::new();
    for key in keys_to_copy {
        let holders = store.tasks.get(&key).map(|t| t.who_has.clone()).unwrap_or_default();
        if holders.len() > 1 {
            remove_keys.insert(key);
            continue;
        }
        let Some(recipient) = others.iter().find(|r| {
            store.workers.get(*r).map(|rw| !rw.has_what.contains(&key)).unwrap_or(false)
        }) else {
            continue;
        };
        store.add_replica(&key, recipient);
        batch.to_workers.push((
            recipient.clone(),
            WorkerOutbound::AcquireReplicas {
                keys: vec![key.clone()],
                who_has: vec![(key.clone(), vec![address.clone()])],
                stimulus_id: stimulus_id.clone(),
            },
        ));
        remove_keys.insert(key);
    }

    batch.to_workers.push((
        address.clone(),
        WorkerOutbound::RemoveReplicas { keys: remove_keys.into_iter().collect(), stimulus_id: stimulus_id.clone() },
    ));
    batch.merge(remove_worker(store, plugins, address, now, stimulus_id));
    Ok(batch)
}

/// Releases every client's desires, removes every worker, and clears all
/// task state. Re-registration of workers and the post-restart client
/// broadcast are the caller's responsibility once nannies report back.
pub fn restart(store: &mut Store, plugins: &mut PluginRegistry, now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
    let mut batch = OutboundBatch::default();
    let clients: Vec<ClientId> = store.clients.keys().cloned().collect();
    for c in clients {
        batch.to_clients.push((c, ClientOutbound::Restart));
    }

    let workers: Vec<WorkerAddr> = store.workers.keys().cloned().collect();
    for w in workers {
        batch.merge(remove_worker(store, plugins, &w, now, stimulus_id.clone()));
    }

    store.tasks.clear();
    store.groups.clear();
    store.prefixes.clear();
    store.computations.clear();
    store.generation += 1;
    for c in store.clients.values_mut() {
        c.wants_what.clear();
    }
    plugins.notify_restart();
    batch
}
