//! Cluster scheduler: the in-memory task/worker/client state machine and
//! the policies that decide where a task runs and when data should move.
//!
//! This crate implements the single logical event loop at the center of a
//! distributed task-execution cluster. It does not talk to a network, run
//! user code, or persist anything to disk -- callers own the transport,
//! the worker processes, and any discovery file; this crate owns exactly
//! the state machine in `transition.rs` and the policies in `policy.rs`
//! and `rebalance.rs` that keep it correct and reasonably well balanced.
//!
//! See `scheduler::Scheduler` for the entry point.

mod client;
mod computation;
mod config;
mod dispatcher;
mod error;
mod graph;
mod group;
mod ids;
mod lifecycle;
mod messages;
mod orderedset;
mod plugin;
mod policy;
mod prefix;
mod rebalance;
mod scheduler;
mod store;
mod task;
mod transition;
mod worker;

pub use client::{ClientState, FIRE_AND_FORGET};
pub use computation::Computation;
pub use config::{RebalanceMeasure, SchedulerConfig};
pub use error::{err, Error, InvariantViolation, Result};
pub use graph::{GraphSubmission, TaskAnnotations};
pub use group::TaskGroup;
pub use ids::{ClientId, GroupKey, Priority, PrefixKey, StimulusId, TaskKey, Timestamp, WorkerAddr};
pub use messages::{
    heartbeat_interval, ClientInbound, ClientOutbound, HeartbeatWorkerReply, OutboundBatch,
    RegisterWorkerReply, WorkerInbound, WorkerOutbound,
};
pub use plugin::{PluginRegistry, SchedulerPlugin};
pub use prefix::TaskPrefix;
pub use rebalance::{RebalanceMove, RebalancePlan};
pub use scheduler::Scheduler;
pub use store::Store;
pub use task::{RestrictionMode, Restrictions, Task, TaskState, UNKNOWN_NBYTES};
pub use worker::{WorkerState, WorkerStatus};

#[cfg(test)]
mod test;
