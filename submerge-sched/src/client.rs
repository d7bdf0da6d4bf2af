//! Client-side bookkeeping.
//!
//! A synthetic `fire-and-forget` client always exists: anything it wants
//! survives until it completes or errs, even after the submitting client
//! disconnects. See `lifecycle.rs` for how real clients acquire and
//! release it.

use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{ClientId, TaskKey, Timestamp};

pub const FIRE_AND_FORGET: &str = "fire-and-forget";

#[derive(Clone, Debug)]
pub struct ClientState {
    pub id: ClientId,
    pub wants_what: BTreeSet<TaskKey>,
    pub last_seen: Timestamp,
    pub versions: BTreeMap<String, String>,
}

impl ClientState {
    pub fn new(id: ClientId) -> ClientState {
        ClientState {
            id,
            wants_what: BTreeSet::new(),
            last_seen: Timestamp(0.0),
            versions: BTreeMap::new(),
        }
    }
}
