//! The plugin hook surface.
//!
//! Polymorphism here is shallow on purpose: a plugin is a bag of optional
//! callbacks, not a trait object hierarchy. Every callback is infallible
//! from the engine's point of view -- a panic-unwind-free `Result` is
//! logged and swallowed rather than propagated, because a plugin fault must
//! never break the state machine.

use crate::ids::{ClientId, StimulusId, TaskKey, WorkerAddr};
use crate::task::TaskState;

pub trait SchedulerPlugin: std::fmt::Debug {
    fn transition(
        &mut self,
        _key: &TaskKey,
        _start: TaskState,
        _finish: TaskState,
        _stimulus_id: &StimulusId,
    ) {
    }

    fn add_worker(&mut self, _worker: &WorkerAddr) {}
    fn remove_worker(&mut self, _worker: &WorkerAddr) {}
    fn add_client(&mut self, _client: &ClientId) {}
    fn remove_client(&mut self, _client: &ClientId) {}
    fn update_graph(&mut self, _stimulus_id: &StimulusId) {}
    fn restart(&mut self) {}
    fn before_close(&mut self) {}
    fn close(&mut self) {}
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn SchedulerPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("count", &self.plugins.len()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Box<dyn SchedulerPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn notify_transition(
        &mut self,
        key: &TaskKey,
        start: TaskState,
        finish: TaskState,
        stimulus_id: &StimulusId,
    ) {
        for plugin in self.plugins.iter_mut() {
            let guard = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                plugin.transition(key, start, finish, stimulus_id);
            }));
            if guard.is_err() {
                tracing::warn!(target: "submerge_sched", key = %key, "plugin panicked during transition callback");
            }
        }
    }

    pub fn notify_add_worker(&mut self, worker: &WorkerAddr) {
        for plugin in self.plugins.iter_mut() {
            plugin.add_worker(worker);
        }
    }

    pub fn notify_remove_worker(&mut self, worker: &WorkerAddr) {
        for plugin in self.plugins.iter_mut() {
            plugin.remove_worker(worker);
        }
    }

    pub fn notify_add_client(&mut self, client: &ClientId) {
        for plugin in self.plugins.iter_mut() {
            plugin.add_client(client);
        }
    }

    pub fn notify_remove_client(&mut self, client: &ClientId) {
        for plugin in self.plugins.iter_mut() {
            plugin.remove_client(client);
        }
    }

    pub fn notify_restart(&mut self) {
        for plugin in self.plugins.iter_mut() {
            plugin.restart();
        }
    }

    pub fn notify_update_graph(&mut self, stimulus_id: &StimulusId) {
        for plugin in self.plugins.iter_mut() {
            plugin.update_graph(stimulus_id);
        }
    }

    /// Called by the host before tearing the scheduler down. Not invoked
    /// from anywhere in this crate -- there is no shutdown operation in the
    /// core itself -- but the hook point is part of the plugin capability
    /// set a host may drive.
    pub fn notify_before_close(&mut self) {
        for plugin in self.plugins.iter_mut() {
            plugin.before_close();
        }
    }

    pub fn notify_close(&mut self) {
        for plugin in self.plugins.iter_mut() {
            plugin.close();
        }
    }
}
