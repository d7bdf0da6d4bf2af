// A server collects together all resources necessary to function as a replica
// of realm's tables and to support all necesary functions of the realm.
//
// A server may support one or more clients, or it may be configured strictly as
// an unloaded replica for redundancy.
//
// A server may be an active or passive replica. Active replicas participate in
// the replicated commit protocol, and therefore wait for one another (or at
// least a quorum of one another). Passive replicas can lag behind active
// replicas, can store and flood low-consistency data, but cannot initiate
// high-consistency write transactions.

use submerge_base::Result;
use submerge_sched::{Scheduler, SchedulerConfig};

pub enum ServerState {
    Idle,
    Running,
}

pub trait ServerTrait {
    fn state(&self) -> ServerState;
}

/// The scheduler half of a server: owns the cluster's task/worker/client
/// state machine. A server that also replicates table data (the rest of
/// `ServerTrait`) would run this alongside its own replica; the scheduler
/// itself has no dependency on that machinery.
pub struct ServerImpl {
    state: ServerState,
    scheduler: Scheduler,
}

impl ServerImpl {
    pub fn new() -> Result<ServerImpl> {
        Ok(ServerImpl { state: ServerState::Idle, scheduler: Scheduler::new(SchedulerConfig::from_env_and_defaults()?) })
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn start(&mut self) {
        self.state = ServerState::Running;
    }
}

impl ServerTrait for ServerImpl {
    fn state(&self) -> ServerState {
        match self.state {
            ServerState::Idle => ServerState::Idle,
            ServerState::Running => ServerState::Running,
        }
    }
}

pub type Server = Box<dyn ServerTrait>;
