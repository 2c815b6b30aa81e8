//! Typed change model and settings for Stagehand.
//!
//! This crate defines the schema layer: validated configuration key paths
//! (`KeyPath`), desired changes (`ConfigChange`) with their target selectors,
//! hook sets, asynchronous job requests, the `stagehand.toml` settings file
//! (`Settings`) and the `CommandRegistry` that turns `key=value` assignments
//! into typed changes.

pub mod change;
pub mod keypath;
pub mod registry;
pub mod settings;
pub mod types;

pub use change::{ConfigChange, HookSet, JobAction, JobRequest, TargetSelector};
pub use keypath::KeyPath;
pub use registry::{CommandKind, CommandRegistry, CommandSpec, RepoSource};
pub use settings::{
    load_settings_file, parse_settings_str, FirmwareSection, InventorySection, MockSection,
    PackagesSection, PathsSection, RuntimeSection, Settings, SettingsError, SslSection,
};
pub use types::{validate_identifier, JobId, TargetId, UnitId};

use thiserror::Error;

/// Malformed caller input. Raised before any side effect, so the caller may
/// correct the input and retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed key path '{path}': {reason}")]
    KeyPath { path: String, reason: String },
    #[error("malformed assignment '{0}', expected '<key/path>=<value>'")]
    Assignment(String),
    #[error("change has no values")]
    EmptyChange,
    #[error("key '{key}' is not accepted by command '{command}'")]
    KeyNotAllowed { command: String, key: String },
    #[error("invalid target selector '{0}'")]
    Selector(String),
    #[error("invalid {kind} '{value}': expected [A-Za-z0-9_.-]")]
    Identifier { kind: &'static str, value: String },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("command '{command}' is a {actual} command, not {expected}")]
    CommandKind {
        command: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{0}")]
    Source(String),
    #[error("required setting '{0}' is not set")]
    MissingSetting(String),
    #[error("no components configured for update")]
    NoComponents,
}
