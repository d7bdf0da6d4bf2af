//! Opaque identifiers shared across the scheduler's entity tables.
//!
//! Every id here is a thin newtype over a string or integer so the store
//! modules never confuse a task key for a worker address at the type level.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TaskKey(pub String);

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        TaskKey(s.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        TaskKey(s)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WorkerAddr(pub String);

impl fmt::Display for WorkerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for WorkerAddr {
    fn from(s: &str) -> Self {
        WorkerAddr(s.to_string())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

/// A task's leading key segment, shared by every task invoking the same
/// function. Distinct from [`GroupKey`], which further splits a prefix
/// into per-submission cohorts.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PrefixKey(pub String);

impl From<&str> for PrefixKey {
    fn from(s: &str) -> Self {
        PrefixKey(s.to_string())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub String);

impl From<&str> for GroupKey {
    fn from(s: &str) -> Self {
        GroupKey(s.to_string())
    }
}

/// Lexicographic scheduling priority: lower sorts first. The user-supplied
/// component is negated so that larger user priorities win ties against the
/// submission generation and within-graph insertion order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub neg_user: i64,
    pub generation: i64,
    pub graph_order: i64,
}

impl Priority {
    pub fn new(user_priority: i64, generation: i64, graph_order: i64) -> Priority {
        Priority { neg_user: -user_priority, generation, graph_order }
    }
}

/// Wall-clock seconds since an arbitrary epoch, as reported by the caller.
/// The scheduler never reads the system clock itself; every timestamp
/// arrives as a stimulus argument so replaying a trace is deterministic.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp(pub f64);

impl Timestamp {
    pub fn sub(self, other: Timestamp) -> f64 {
        self.0 - other.0
    }
}

pub type StimulusId = String;
