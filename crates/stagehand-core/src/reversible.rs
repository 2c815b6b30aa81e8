use crate::CoreError;
use stagehand_runtime::{RemoteExecutor, TargetOutputs};
use stagehand_schema::{ConfigChange, TargetId};
use stagehand_store::{ConfigSnapshot, ConfigStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Something that can be captured before a side effect and put back after.
///
/// `restore` must tolerate an action that only partly happened.
pub trait ReversibleAction {
    type Snapshot;

    fn describe(&self) -> String;

    fn capture(&self) -> Result<Self::Snapshot, CoreError>;

    fn restore(&self, snapshot: &Self::Snapshot) -> Result<(), CoreError>;
}

/// A captured snapshot waiting to be either confirmed or restored.
///
/// Consumed by exactly one of [`confirm`](Self::confirm) or
/// [`restore`](Self::restore).
#[must_use = "an action record must be confirmed or restored"]
pub struct ActionRecord<A: ReversibleAction> {
    action: A,
    snapshot: A::Snapshot,
}

impl<A: ReversibleAction> ActionRecord<A> {
    pub fn begin(action: A) -> Result<Self, CoreError> {
        let snapshot = action.capture()?;
        debug!("captured {}", action.describe());
        Ok(Self { action, snapshot })
    }

    pub fn snapshot(&self) -> &A::Snapshot {
        &self.snapshot
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    pub fn confirm(self) -> A::Snapshot {
        debug!("confirmed {}", self.action.describe());
        self.snapshot
    }

    /// Put the snapshot back. One retry, then the error is returned.
    pub fn restore(self) -> Result<(), CoreError> {
        match self.action.restore(&self.snapshot) {
            Ok(()) => {
                debug!("restored {}", self.action.describe());
                Ok(())
            }
            Err(first) => {
                warn!(
                    "restoring {} failed, retrying: {first}",
                    self.action.describe()
                );
                self.action.restore(&self.snapshot)
            }
        }
    }

    /// Restore and hand back the error that caused it, or a
    /// [`CoreError::RestoreFailed`] carrying both when the restore fails too.
    pub fn unwind(self, original: CoreError) -> CoreError {
        match self.restore() {
            Ok(()) => original,
            Err(restore) => CoreError::restore_failed(original, restore),
        }
    }
}

/// Stages a change on capture; rolls the store back to the prior values on
/// restore.
pub struct ConfigRollback<'a> {
    store: &'a ConfigStore,
    change: &'a ConfigChange,
}

impl<'a> ConfigRollback<'a> {
    pub fn new(store: &'a ConfigStore, change: &'a ConfigChange) -> Self {
        Self { store, change }
    }
}

impl ReversibleAction for ConfigRollback<'_> {
    type Snapshot = ConfigSnapshot;

    fn describe(&self) -> String {
        let keys: Vec<&str> = self.change.keys().map(|k| k.as_str()).collect();
        format!("configuration of {}", keys.join(", "))
    }

    fn capture(&self) -> Result<ConfigSnapshot, CoreError> {
        Ok(self.store.stage(self.change)?)
    }

    fn restore(&self, snapshot: &ConfigSnapshot) -> Result<(), CoreError> {
        self.store.rollback(snapshot)?;
        Ok(())
    }
}

/// Package-manager checkpoints on a fixed set of targets.
pub struct PackageRollback<'a> {
    executor: &'a RemoteExecutor,
    targets: Vec<TargetId>,
}

impl<'a> PackageRollback<'a> {
    pub fn new(executor: &'a RemoteExecutor, targets: Vec<TargetId>) -> Self {
        Self { executor, targets }
    }

    pub fn targets(&self) -> &[TargetId] {
        &self.targets
    }
}

impl ReversibleAction for PackageRollback<'_> {
    type Snapshot = TargetOutputs;

    fn describe(&self) -> String {
        format!("package state on {} target(s)", self.targets.len())
    }

    fn capture(&self) -> Result<TargetOutputs, CoreError> {
        Ok(self.executor.package_checkpoints(&self.targets)?)
    }

    fn restore(&self, checkpoints: &TargetOutputs) -> Result<(), CoreError> {
        Ok(self.executor.package_rollback(checkpoints)?)
    }
}

/// Previous bytes of a managed local file. `None` means it did not exist.
pub struct FileRollback {
    path: PathBuf,
}

impl FileRollback {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReversibleAction for FileRollback {
    type Snapshot = Option<Vec<u8>>;

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    fn capture(&self) -> Result<Option<Vec<u8>>, CoreError> {
        if self.path.is_file() {
            Ok(Some(std::fs::read(&self.path)?))
        } else {
            Ok(None)
        }
    }

    fn restore(&self, snapshot: &Option<Vec<u8>>) -> Result<(), CoreError> {
        match snapshot {
            Some(bytes) => {
                let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
                std::fs::create_dir_all(dir)?;
                let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
                tmp.write_all(bytes)?;
                tmp.as_file().sync_all()?;
                tmp.persist(&self.path).map_err(|e| CoreError::Io(e.error))?;
            }
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Flaky {
        failures_left: Cell<u32>,
        restores: Cell<u32>,
    }

    impl ReversibleAction for Flaky {
        type Snapshot = ();

        fn describe(&self) -> String {
            "flaky".to_owned()
        }

        fn capture(&self) -> Result<(), CoreError> {
            Ok(())
        }

        fn restore(&self, _: &()) -> Result<(), CoreError> {
            self.restores.set(self.restores.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(CoreError::Io(std::io::Error::other("transient")));
            }
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures_left: Cell::new(failures),
            restores: Cell::new(0),
        }
    }

    #[test]
    fn restore_retries_once() {
        let action = flaky(1);
        let record = ActionRecord::begin(action).unwrap();
        assert!(record.restore().is_ok());
    }

    #[test]
    fn restore_gives_up_after_retry() {
        let record = ActionRecord::begin(flaky(2)).unwrap();
        let err = record.unwind(CoreError::Interrupted);
        assert!(matches!(err, CoreError::RestoreFailed { .. }));
    }

    #[test]
    fn unwind_returns_original_on_successful_restore() {
        let record = ActionRecord::begin(flaky(0)).unwrap();
        assert_eq!(record.action().restores.get(), 0);
        let err = record.unwind(CoreError::Interrupted);
        assert!(matches!(err, CoreError::Interrupted));
    }

    #[test]
    fn file_rollback_restores_previous_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stx.pem");
        std::fs::write(&path, "old").unwrap();

        let record = ActionRecord::begin(FileRollback::new(&path)).unwrap();
        std::fs::write(&path, "new").unwrap();
        record.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn file_rollback_removes_file_that_did_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssl").join("stx.pem");

        let record = ActionRecord::begin(FileRollback::new(&path)).unwrap();
        assert!(record.snapshot().is_none());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "new").unwrap();
        record.restore().unwrap();
        assert!(!path.exists());
    }
}
