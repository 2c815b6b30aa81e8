use crate::CoreError;
use std::fmt;
use tracing::trace;

/// States of one configuration change as the coordinator drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Idle,
    Staged,
    PreHooksApplied,
    Committed,
    PostHooksApplied,
    Restoring,
    RolledBack,
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeState::Idle => write!(f, "idle"),
            ChangeState::Staged => write!(f, "staged"),
            ChangeState::PreHooksApplied => write!(f, "pre-hooks-applied"),
            ChangeState::Committed => write!(f, "committed"),
            ChangeState::PostHooksApplied => write!(f, "post-hooks-applied"),
            ChangeState::Restoring => write!(f, "restoring"),
            ChangeState::RolledBack => write!(f, "rolled-back"),
        }
    }
}

pub fn validate_transition(from: ChangeState, to: ChangeState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ChangeState::Idle, ChangeState::Staged)
            | (
                ChangeState::Staged,
                ChangeState::PreHooksApplied | ChangeState::RolledBack
            )
            | (
                ChangeState::PreHooksApplied,
                ChangeState::Committed | ChangeState::Restoring
            )
            | (
                ChangeState::Committed,
                ChangeState::PostHooksApplied | ChangeState::Restoring
            )
            | (ChangeState::Restoring, ChangeState::RolledBack)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Current state of a change; every move goes through [`validate_transition`].
#[derive(Debug)]
pub struct Lifecycle {
    state: ChangeState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: ChangeState::Idle,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ChangeState {
        self.state
    }

    pub fn advance(&mut self, to: ChangeState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        trace!("change state: {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }
}
