//! A logical graph submission, retained for introspection only. Nothing
//! in the transition engine reads a `Computation`; it exists purely so a
//! caller can ask "what was running when this key failed."

use std::collections::BTreeSet;

use crate::ids::{GroupKey, Timestamp};

#[derive(Clone, Debug)]
pub struct Computation {
    pub groups: BTreeSet<GroupKey>,
    pub start: Timestamp,
    pub code: Vec<String>,
}

impl Computation {
    pub fn new(start: Timestamp) -> Computation {
        Computation { groups: BTreeSet::new(), start, code: Vec::new() }
    }
}
