use crate::RuntimeError;
use stagehand_schema::{Settings, TargetId, UnitId};
use std::sync::Arc;

/// Delivery of work to a single target node.
///
/// Implementations are called concurrently from the executor pool, one call
/// per target and step.
pub trait TargetBackend: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Apply a named change-unit on one target. Returns its output.
    fn apply_unit(&self, target: &TargetId, unit: &UnitId) -> Result<String, RuntimeError>;

    fn run_command(&self, target: &TargetId, command: &str) -> Result<String, RuntimeError>;

    /// Capture an opaque package-manager checkpoint on the target.
    fn package_checkpoint(&self, _target: &TargetId) -> Result<String, RuntimeError> {
        Err(RuntimeError::Unsupported(
            "package checkpoints",
            self.name().to_owned(),
        ))
    }

    fn package_rollback(&self, _target: &TargetId, _checkpoint: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported(
            "package rollback",
            self.name().to_owned(),
        ))
    }
}

pub fn select_backend(settings: &Settings) -> Result<Arc<dyn TargetBackend>, RuntimeError> {
    match settings.runtime.backend.as_str() {
        "shell" => Ok(Arc::new(crate::shell::ShellBackend::from_settings(settings))),
        "mock" => Ok(Arc::new(crate::mock::MockBackend::from_settings(
            &settings.runtime.mock,
        ))),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_schema::parse_settings_str;

    fn settings(backend: &str) -> Settings {
        let mut settings = parse_settings_str(
            r#"
settings_version = 1
[inventory]
targets = ["node-1"]
"#,
        )
        .unwrap();
        settings.runtime.backend = backend.to_owned();
        settings
    }

    #[test]
    fn select_valid_backends() {
        assert_eq!(select_backend(&settings("shell")).unwrap().name(), "shell");
        assert_eq!(select_backend(&settings("mock")).unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend(&settings("salt")),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }
}
