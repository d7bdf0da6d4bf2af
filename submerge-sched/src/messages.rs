//! The worker and client message catalogs from the scheduler's external
//! interface. Encoding these onto an actual wire is out of scope here; the
//! dispatcher only ever produces and consumes these typed values, leaving
//! serialization to a transport crate the way `submerge-net` serializes
//! its own `Msg` with `rmp-serde`.

use crate::ids::{ClientId, StimulusId, TaskKey, WorkerAddr};

#[derive(Clone, Debug)]
pub enum WorkerInbound {
    TaskFinished {
        key: TaskKey,
        worker: WorkerAddr,
        nbytes: Option<i64>,
        typename: Option<String>,
        start: f64,
        stop: f64,
    },
    TaskErred {
        key: TaskKey,
        worker: WorkerAddr,
        exception: String,
        traceback: String,
        cause: Option<TaskKey>,
    },
    ReleaseWorkerData {
        key: TaskKey,
        worker: WorkerAddr,
    },
    AddKeys {
        worker: WorkerAddr,
        keys: Vec<TaskKey>,
    },
    MissingData {
        key: TaskKey,
        errant_worker: WorkerAddr,
    },
    LongRunning {
        key: TaskKey,
        worker: WorkerAddr,
        compute_duration: f64,
    },
    Reschedule {
        key: TaskKey,
        worker: WorkerAddr,
    },
    KeepAlive,
    WorkerStatusChange {
        worker: WorkerAddr,
        status: String,
    },
}

#[derive(Clone, Debug)]
pub enum WorkerOutbound {
    ComputeTask {
        key: TaskKey,
        priority: crate::ids::Priority,
        duration: f64,
        who_has: Vec<(TaskKey, Vec<WorkerAddr>)>,
        nbytes: i64,
        resource_restrictions: Vec<(String, u64)>,
        actor: bool,
        run_spec: Vec<u8>,
        stimulus_id: StimulusId,
    },
    FreeKeys {
        keys: Vec<TaskKey>,
        stimulus_id: StimulusId,
    },
    RemoveReplicas {
        keys: Vec<TaskKey>,
        stimulus_id: StimulusId,
    },
    AcquireReplicas {
        keys: Vec<TaskKey>,
        who_has: Vec<(TaskKey, Vec<WorkerAddr>)>,
        stimulus_id: StimulusId,
    },
    CancelCompute {
        key: TaskKey,
        stimulus_id: StimulusId,
    },
    Close {
        report: bool,
    },
}

#[derive(Clone, Debug)]
pub enum ClientInbound {
    UpdateGraph,
    ClientDesiresKeys { keys: Vec<TaskKey>, client: ClientId },
    ClientReleasesKeys { keys: Vec<TaskKey>, client: ClientId },
    HeartbeatClient { client: ClientId },
    CloseClient { client: ClientId },
    Restart,
    Cancel { keys: Vec<TaskKey>, client: ClientId, force: bool },
    Retry { keys: Vec<TaskKey> },
}

#[derive(Clone, Debug)]
pub enum ClientOutbound {
    KeyInMemory { key: TaskKey, typename: Option<String> },
    TaskErred { key: TaskKey, exception: String, traceback: String },
    TaskRetried { key: TaskKey },
    LostData { key: TaskKey },
    CancelledKey { key: TaskKey },
    Restart,
    Event { topic: String, message: String },
}

/// A batch of outbound messages produced by draining one stimulus to a
/// fixed point. The dispatcher flushes a batch as a unit so no peer ever
/// observes a partial view of a cascaded transition.
#[derive(Clone, Debug, Default)]
pub struct OutboundBatch {
    pub to_workers: Vec<(WorkerAddr, WorkerOutbound)>,
    pub to_clients: Vec<(ClientId, ClientOutbound)>,
}

impl OutboundBatch {
    pub fn merge(&mut self, other: OutboundBatch) {
        self.to_workers.extend(other.to_workers);
        self.to_clients.extend(other.to_clients);
    }
}

#[derive(Clone, Debug)]
pub struct HeartbeatWorkerReply {
    pub status: String,
    pub time: f64,
    pub heartbeat_interval: f64,
}

#[derive(Clone, Debug)]
pub struct RegisterWorkerReply {
    pub status: String,
    pub time: f64,
    pub heartbeat_interval: f64,
}

pub fn heartbeat_interval(worker_count: usize) -> f64 {
    if worker_count <= 10 {
        0.5
    } else if worker_count <= 50 {
        1.0
    } else if worker_count <= 200 {
        2.0
    } else {
        (worker_count as f64) / 200.0 + 1.0
    }
}
