//! Runtime configuration, read once at construction.
//!
//! Every field has a default matching a production cluster's out-of-the-box
//! behavior. A field may be overridden by setting the environment variable
//! `SUBMERGE_SCHED_<FIELD>` (upper-cased, underscored) before the config is
//! built; it is never re-read after that, so a running scheduler cannot be
//! reconfigured by mutating its own environment.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use crate::error::{err, Result};
use crate::ids::PrefixKey;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebalanceMeasure {
    Optimistic,
    Managed,
    Process,
}

impl FromStr for RebalanceMeasure {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "optimistic" => Ok(RebalanceMeasure::Optimistic),
            "managed" => Ok(RebalanceMeasure::Managed),
            "process" => Ok(RebalanceMeasure::Process),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub bandwidth: f64,
    pub default_data_size: i64,
    pub unknown_task_duration: f64,
    pub default_task_durations: BTreeMap<PrefixKey, f64>,
    pub worker_ttl: f64,
    pub allowed_failures: u32,
    pub transition_log_length: usize,
    pub events_log_length: usize,
    pub events_cleanup_delay: f64,
    pub computations_max_history: usize,
    pub validate: bool,
    pub memory_recent_to_old_time: f64,
    pub memory_rebalance_measure: RebalanceMeasure,
    pub memory_rebalance_sender_min: f64,
    pub memory_rebalance_recipient_max: f64,
    pub memory_rebalance_sender_recipient_gap: f64,
    pub work_stealing_installed: bool,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            bandwidth: 100_000_000.0,
            default_data_size: 1000,
            unknown_task_duration: 0.5,
            default_task_durations: BTreeMap::new(),
            worker_ttl: 300.0,
            allowed_failures: 3,
            transition_log_length: 100_000,
            events_log_length: 100_000,
            events_cleanup_delay: 1.0,
            computations_max_history: 100,
            validate: false,
            memory_recent_to_old_time: 30.0,
            memory_rebalance_measure: RebalanceMeasure::Optimistic,
            memory_rebalance_sender_min: 0.3,
            memory_rebalance_recipient_max: 0.6,
            memory_rebalance_sender_recipient_gap: 0.1,
            work_stealing_installed: false,
        }
    }
}

fn env_override<T: FromStr>(field: &str, current: T) -> T {
    let var = format!("SUBMERGE_SCHED_{}", field.to_uppercase());
    match env::var(&var) {
        Ok(raw) => raw.parse().unwrap_or(current),
        Err(_) => current,
    }
}

impl SchedulerConfig {
    /// Applies environment overrides for the scalar fields and validates the
    /// resulting configuration. Map-valued fields (`default_task_durations`)
    /// are not env-overridable; callers pass those in directly.
    pub fn from_env_and_defaults() -> Result<SchedulerConfig> {
        let mut cfg = SchedulerConfig::default();
        cfg.bandwidth = env_override("bandwidth", cfg.bandwidth);
        cfg.default_data_size = env_override("default_data_size", cfg.default_data_size);
        cfg.unknown_task_duration =
            env_override("unknown_task_duration", cfg.unknown_task_duration);
        cfg.worker_ttl = env_override("worker_ttl", cfg.worker_ttl);
        cfg.allowed_failures = env_override("allowed_failures", cfg.allowed_failures);
        cfg.transition_log_length =
            env_override("transition_log_length", cfg.transition_log_length);
        cfg.events_log_length = env_override("events_log_length", cfg.events_log_length);
        cfg.events_cleanup_delay =
            env_override("events_cleanup_delay", cfg.events_cleanup_delay);
        cfg.computations_max_history =
            env_override("computations_max_history", cfg.computations_max_history);
        cfg.validate = env_override("validate", cfg.validate);
        cfg.memory_recent_to_old_time =
            env_override("memory_recent_to_old_time", cfg.memory_recent_to_old_time);
        cfg.memory_rebalance_sender_min =
            env_override("memory_rebalance_sender_min", cfg.memory_rebalance_sender_min);
        cfg.memory_rebalance_recipient_max = env_override(
            "memory_rebalance_recipient_max",
            cfg.memory_rebalance_recipient_max,
        );
        cfg.memory_rebalance_sender_recipient_gap = env_override(
            "memory_rebalance_sender_recipient_gap",
            cfg.memory_rebalance_sender_recipient_gap,
        );
        cfg.work_stealing_installed =
            env_override("work_stealing_installed", cfg.work_stealing_installed);
        if let Ok(raw) = env::var("SUBMERGE_SCHED_MEMORY_REBALANCE_MEASURE") {
            if let Ok(m) = raw.parse() {
                cfg.memory_rebalance_measure = m;
            }
        }
        cfg.validate_ranges()?;
        Ok(cfg)
    }

    fn validate_ranges(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.memory_rebalance_sender_min) {
            return Err(err("memory_rebalance_sender_min must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.memory_rebalance_recipient_max) {
            return Err(err("memory_rebalance_recipient_max must be in [0, 1]"));
        }
        if self.bandwidth <= 0.0 {
            return Err(err("bandwidth must be positive"));
        }
        Ok(())
    }
}
