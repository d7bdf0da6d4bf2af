//! Error surface for the scheduler core.
//!
//! Following the rest of the workspace, errors are backtrace-carrying and
//! logged at creation time via [`submerge_base::Error`]. Bad per-key input
//! (an unknown key named in a restriction or a release request) is never
//! turned into an `Error` at all -- it is dropped where it is discovered,
//! per the propagation policy in the scheduler design notes.

pub use submerge_base::{err, Error, Result};

/// Raised only when `validate` is enabled and a transition leaves an
/// invariant violated. Outside validate mode the corresponding checks are
/// skipped entirely rather than collected into this type.
#[derive(Debug)]
pub struct InvariantViolation {
    pub key: String,
    pub detail: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invariant violated for {}: {}", self.key, self.detail)
    }
}

impl std::error::Error for InvariantViolation {}

impl InvariantViolation {
    pub fn new(key: impl Into<String>, detail: impl Into<String>) -> InvariantViolation {
        InvariantViolation { key: key.into(), detail: detail.into() }
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }
}
