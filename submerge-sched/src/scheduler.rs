//! The public facade: owns the entity store and plugin registry, and
//! exposes one method per external stimulus. Every method runs to
//! completion and returns the `OutboundBatch` the caller must flush --
//! the scheduler itself never performs I/O.

use crate::client::FIRE_AND_FORGET;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::graph::GraphSubmission;
use crate::ids::{ClientId, StimulusId, TaskKey, Timestamp, WorkerAddr};
use crate::messages::{OutboundBatch, WorkerInbound};
use crate::plugin::{PluginRegistry, SchedulerPlugin};
use crate::rebalance::{plan_rebalance, RebalancePlan};
use crate::store::Store;
use crate::task::TaskState;
use crate::transition::{transitions, Recommendations, TransitionContext};
use crate::{dispatcher, lifecycle};

pub struct Scheduler {
    pub store: Store,
    plugins: PluginRegistry,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Scheduler {
        Scheduler { store: Store::new(config), plugins: PluginRegistry::new() }
    }

    pub fn from_env() -> Result<Scheduler> {
        Ok(Scheduler::new(SchedulerConfig::from_env_and_defaults()?))
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn SchedulerPlugin>) {
        self.plugins.register(plugin);
    }

    pub fn update_graph(
        &mut self,
        submission: GraphSubmission,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> OutboundBatch {
        crate::graph::update_graph(&mut self.store, &mut self.plugins, submission, now, stimulus_id)
    }

    pub fn handle_worker_message(
        &mut self,
        msg: WorkerInbound,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> OutboundBatch {
        dispatcher::handle_worker_message(&mut self.store, &mut self.plugins, msg, now, stimulus_id)
    }

    pub fn add_worker(
        &mut self,
        address: WorkerAddr,
        host: String,
        nthreads: u32,
        memory_limit: i64,
        already_in_memory: Vec<TaskKey>,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> Result<OutboundBatch> {
        lifecycle::add_worker(
            &mut self.store,
            &mut self.plugins,
            address,
            host,
            nthreads,
            memory_limit,
            already_in_memory,
            now,
            stimulus_id,
        )
    }

    pub fn remove_worker(&mut self, address: &WorkerAddr, now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
        lifecycle::remove_worker(&mut self.store, &mut self.plugins, address, now, stimulus_id)
    }

    pub fn retire_worker(
        &mut self,
        address: &WorkerAddr,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> Result<OutboundBatch> {
        lifecycle::retire_worker(&mut self.store, &mut self.plugins, address, now, stimulus_id)
    }

    pub fn heartbeat_worker(&mut self, address: &WorkerAddr, now: Timestamp, process_memory: Option<i64>, clock_delay: f64) {
        lifecycle::heartbeat_worker(&mut self.store, address, now, process_memory, clock_delay)
    }

    pub fn expire_stale_workers(&mut self, now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
        lifecycle::expire_stale_workers(&mut self.store, &mut self.plugins, now, stimulus_id)
    }

    pub fn add_client(&mut self, client: ClientId, now: Timestamp) {
        lifecycle::add_client(&mut self.store, &mut self.plugins, client, now)
    }

    pub fn remove_client(&mut self, client: &ClientId, now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
        lifecycle::remove_client(&mut self.store, &mut self.plugins, client, now, stimulus_id)
    }

    pub fn client_desires_keys(&mut self, keys: &[TaskKey], client: &ClientId) {
        self.store.clients.entry(client.clone()).or_insert_with(|| crate::client::ClientState::new(client.clone()));
        for key in keys {
            if let Some(t) = self.store.tasks.get_mut(key) {
                t.who_wants.insert(client.clone());
            }
            if let Some(c) = self.store.clients.get_mut(client) {
                c.wants_what.insert(key.clone());
            }
        }
    }

    /// Releases `client`'s interest in `keys`. Keys with no remaining
    /// wanter that are already in memory are recommended back to
    /// `released`; unknown keys are ignored.
    pub fn client_releases_keys(
        &mut self,
        keys: &[TaskKey],
        client: &ClientId,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> OutboundBatch {
        let mut recs = Recommendations::new();
        for key in keys {
            if let Some(t) = self.store.tasks.get_mut(key) {
                t.who_wants.remove(client);
                if t.who_wants.is_empty() && t.state == TaskState::Memory {
                    recs.push(key.clone(), TaskState::Released);
                }
            }
            if let Some(c) = self.store.clients.get_mut(client) {
                c.wants_what.remove(key);
            }
        }
        let mut ctx = TransitionContext { store: &mut self.store, plugins: &mut self.plugins, stimulus_id, now };
        transitions(&mut ctx, recs)
    }

    /// Marks `keys` as fire-and-forget: they survive past the submitting
    /// client's disconnect until they complete or err.
    pub fn fire_and_forget(&mut self, keys: &[TaskKey]) {
        for key in keys {
            crate::transition::mark_fire_and_forget(&mut self.store, key);
        }
        let _ = FIRE_AND_FORGET;
    }

    /// Cancels `keys`. With `force`, cascades to dependents regardless of
    /// other wanters; otherwise only cancels a key no other client wants.
    pub fn cancel(
        &mut self,
        keys: &[TaskKey],
        client: &ClientId,
        force: bool,
        now: Timestamp,
        stimulus_id: StimulusId,
    ) -> OutboundBatch {
        let mut recs = Recommendations::new();
        for key in keys {
            if let Some(t) = self.store.tasks.get_mut(key) {
                t.who_wants.remove(client);
                if force || t.who_wants.is_empty() {
                    recs.push(key.clone(), TaskState::Forgotten);
                }
            }
        }
        let mut ctx = TransitionContext { store: &mut self.store, plugins: &mut self.plugins, stimulus_id, now };
        transitions(&mut ctx, recs)
    }

    /// Re-arms retries on previously erred keys and recommends them back
    /// to `waiting`.
    pub fn retry(&mut self, keys: &[TaskKey], now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
        let mut recs = Recommendations::new();
        for key in keys {
            if self.store.tasks.get(key).map(|t| t.state) == Some(TaskState::Erred) {
                recs.push(key.clone(), TaskState::Released);
            }
        }
        let mut ctx = TransitionContext { store: &mut self.store, plugins: &mut self.plugins, stimulus_id, now };
        let mut batch = transitions(&mut ctx, recs);
        let mut recs2 = Recommendations::new();
        for key in keys {
            if self.store.tasks.get(key).map(|t| t.state) == Some(TaskState::Released) {
                recs2.push(key.clone(), TaskState::Waiting);
            }
        }
        let mut ctx = TransitionContext { store: &mut self.store, plugins: &mut self.plugins, stimulus_id: "retry".into(), now };
        batch.merge(transitions(&mut ctx, recs2));
        batch
    }

    pub fn plan_rebalance(
        &self,
        now: Timestamp,
        workers: Option<&std::collections::BTreeSet<WorkerAddr>>,
        keys: Option<&std::collections::BTreeSet<TaskKey>>,
    ) -> RebalancePlan {
        plan_rebalance(&self.store, now, workers, keys)
    }

    /// Executes a previously computed rebalance plan: moves each key's
    /// replica bookkeeping from sender to recipient and produces the
    /// worker messages that actually move the bytes.
    pub fn apply_rebalance(&mut self, plan: &RebalancePlan, stimulus_id: StimulusId) -> OutboundBatch {
        let mut batch = OutboundBatch::default();
        for mv in &plan.moves {
            self.store.add_replica(&mv.key, &mv.recipient);
            batch.to_workers.push((
                mv.recipient.clone(),
                crate::messages::WorkerOutbound::AcquireReplicas {
                    keys: vec![mv.key.clone()],
                    who_has: vec![(mv.key.clone(), vec![mv.sender.clone()])],
                    stimulus_id: stimulus_id.clone(),
                },
            ));
        }
        for mv in &plan.moves {
            self.store.remove_replica(&mv.key, &mv.sender);
        }
        for (sender, keys) in group_by_sender(&plan.moves) {
            batch.to_workers.push((
                sender,
                crate::messages::WorkerOutbound::RemoveReplicas { keys, stimulus_id: stimulus_id.clone() },
            ));
        }
        batch
    }

    pub fn restart(&mut self, now: Timestamp, stimulus_id: StimulusId) -> OutboundBatch {
        lifecycle::restart(&mut self.store, &mut self.plugins, now, stimulus_id)
    }
}

fn group_by_sender(
    moves: &[crate::rebalance::RebalanceMove],
) -> Vec<(WorkerAddr, Vec<TaskKey>)> {
    let mut map: std::collections::BTreeMap<WorkerAddr, Vec<TaskKey>> = std::collections::BTreeMap::new();
    for mv in moves {
        map.entry(mv.sender.clone()).or_default().push(mv.key.clone());
    }
    map.into_iter().collect()
}
