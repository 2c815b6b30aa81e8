//! Core orchestration for Stagehand configuration changes.
//!
//! This crate ties together the schema, the configuration store, and the
//! remote executor into the `Engine`, the central API for staged changes,
//! package updates, certificate and firmware delivery, and asynchronous jobs.
//! It also provides the change lifecycle state machine, the
//! `ReversibleAction` capture/restore contract, and store locking.

pub mod concurrency;
pub mod coordinator;
pub mod engine;
pub mod lifecycle;
pub mod package;
pub mod reversible;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use coordinator::{ChangeCoordinator, ChangeReport, HookPhase};
pub use engine::{Engine, SslReport, TargetValues};
pub use lifecycle::{validate_transition, ChangeState, Lifecycle};
pub use package::{PackageUpdater, UpdateReport};
pub use reversible::{ActionRecord, ConfigRollback, FileRollback, PackageRollback, ReversibleAction};

use stagehand_runtime::RuntimeError;
use stagehand_schema::{SettingsError, ValidationError};
use stagehand_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("{phase} hooks failed: {source}")]
    Hook {
        phase: HookPhase,
        #[source]
        source: RuntimeError,
    },
    #[error("update of component '{component}' failed: {source}")]
    ComponentUpdate {
        component: String,
        #[source]
        source: RuntimeError,
    },
    #[error("restoring after '{original}' failed: {restore}; manual intervention required")]
    RestoreFailed {
        original: Box<CoreError>,
        restore: Box<CoreError>,
    },
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("job '{0}' has not completed yet")]
    JobPending(String),
    #[error("shutdown requested before the operation started")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`CoreError`] for callers and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; nothing was changed.
    Validation,
    /// A unit or command failed on at least one target.
    RemoteExecution,
    /// Store or lifecycle state does not allow the operation.
    State,
    /// Compensation itself failed; the store may be inconsistent.
    Restore,
    NotFound,
    Pending,
    Io,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RemoteExecution => "remote execution",
            ErrorKind::State => "state",
            ErrorKind::Restore => "restore",
            ErrorKind::NotFound => "not found",
            ErrorKind::Pending => "pending",
            ErrorKind::Io => "io",
        }
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::JobNotFound(_) => ErrorKind::NotFound,
        StoreError::JobPending(_) => ErrorKind::Pending,
        StoreError::Io(_) | StoreError::Serialization(_) => ErrorKind::Io,
        StoreError::IntegrityFailure { .. }
        | StoreError::NotStaged
        | StoreError::AlreadyStaged { .. }
        | StoreError::StaleStage { .. }
        | StoreError::JobAlreadyCompleted(_)
        | StoreError::LockFailed(_)
        | StoreError::VersionMismatch { .. } => ErrorKind::State,
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) | CoreError::Settings(_) => ErrorKind::Validation,
            CoreError::Store(e) => store_kind(e),
            CoreError::Runtime(e) => match e {
                RuntimeError::UnknownTarget(_)
                | RuntimeError::NoTargets(_)
                | RuntimeError::BackendUnavailable(_) => ErrorKind::Validation,
                RuntimeError::Io(_) => ErrorKind::Io,
                RuntimeError::Store(e) => store_kind(e),
                RuntimeError::ExecFailed(_)
                | RuntimeError::Unsupported(..)
                | RuntimeError::RemoteExecution { .. }
                | RuntimeError::Pool(_) => ErrorKind::RemoteExecution,
            },
            CoreError::InvalidTransition { .. } | CoreError::Interrupted => ErrorKind::State,
            CoreError::Hook { .. } | CoreError::ComponentUpdate { .. } => {
                ErrorKind::RemoteExecution
            }
            CoreError::RestoreFailed { .. } => ErrorKind::Restore,
            CoreError::JobNotFound(_) => ErrorKind::NotFound,
            CoreError::JobPending(_) => ErrorKind::Pending,
            CoreError::Io(_) | CoreError::Serialization(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn restore_failed(original: CoreError, restore: CoreError) -> Self {
        CoreError::RestoreFailed {
            original: Box::new(original),
            restore: Box::new(restore),
        }
    }
}
