//! Remote execution layer for Stagehand.
//!
//! This crate implements delivery of change-units and commands to target
//! nodes: the pluggable `TargetBackend` trait with `mock` and `shell`
//! backends, `Inventory` resolution of target selectors, and the
//! `RemoteExecutor` that fans each step out across targets on a bounded
//! rayon pool and dispatches asynchronous jobs.

pub mod backend;
pub mod executor;
pub mod inventory;
pub mod mock;
pub mod shell;

pub use backend::{select_backend, TargetBackend};
pub use executor::{RemoteExecutor, TargetOutputs};
pub use inventory::Inventory;
pub use mock::MockBackend;
pub use shell::ShellBackend;

use stagehand_schema::TargetId;
use stagehand_store::StoreError;
use std::fmt;
use thiserror::Error;

/// One target's share of a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: TargetId,
    pub error: String,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

fn join_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_targets(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| f.target.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("target '{0}' is not in the inventory")]
    UnknownTarget(String),
    #[error("selector '{0}' resolves to no targets")]
    NoTargets(String),
    #[error("{0}")]
    ExecFailed(String),
    #[error("{0} is not supported by the {1} backend")]
    Unsupported(&'static str, String),
    #[error(
        "remote execution failed: '{step}' failed on {}: {}",
        join_targets(.failures),
        join_failures(.failures)
    )]
    RemoteExecution {
        step: String,
        failures: Vec<TargetFailure>,
    },
    #[error("failed to build execution pool: {0}")]
    Pool(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_execution_names_step_and_targets() {
        let e = RuntimeError::RemoteExecution {
            step: "activate".to_owned(),
            failures: vec![
                TargetFailure {
                    target: TargetId::new("node-2"),
                    error: "exit 1".to_owned(),
                },
                TargetFailure {
                    target: TargetId::new("node-3"),
                    error: "timeout".to_owned(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("'activate'"));
        assert!(msg.contains("node-2, node-3"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn unknown_target_display() {
        let e = RuntimeError::UnknownTarget("node-9".to_owned());
        assert!(e.to_string().contains("node-9"));
    }
}
