use crate::config::{ConfigStore, PriorValues};
use crate::layout::StoreLayout;
use crate::{new_op_id, write_atomic, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A single rollback step that can undo part of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Drop a stage the interrupted operation left pending.
    DiscardStaged,
    /// Write prior configuration values back (after a commit went through).
    RestoreConfig { prior: PriorValues },
    /// Put a managed file back. `backup: None` means the file did not exist.
    RestoreFile {
        path: PathBuf,
        backup: Option<PathBuf>,
    },
    /// Remote side effects that cannot be undone offline. Logged on recovery.
    Manual { note: String },
}

/// The type of mutating operation being tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOpKind {
    Change,
    PackageUpdate,
    SslCerts,
    UpdateRepo,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::Change => write!(f, "change"),
            WalOpKind::PackageUpdate => write!(f, "package update"),
            WalOpKind::SslCerts => write!(f, "ssl certs"),
            WalOpKind::UpdateRepo => write!(f, "update repo"),
        }
    }
}

/// A WAL entry representing an in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    pub subject: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log for crash recovery.
///
/// Mutating operations create an entry before their first side effect,
/// append rollback steps before each further one, and remove the entry on
/// completion (success or finished compensation). Entries found on startup
/// belong to interrupted operations and are rolled back.
pub struct WriteAheadLog {
    layout: StoreLayout,
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            layout: layout.clone(),
            wal_dir: layout.wal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Begin a new WAL entry for an operation. Returns the op_id.
    pub fn begin(&self, kind: WalOpKind, subject: &str) -> Result<String, StoreError> {
        let op_id = new_op_id(subject);
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            subject: subject.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {} for {subject} (op_id={op_id})", entry.kind);
        Ok(op_id)
    }

    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)
    }

    /// Copy the current content of `path` next to the entry and return the
    /// step that puts it back.
    pub fn stash_file(&self, op_id: &str, path: &Path) -> Result<RollbackStep, StoreError> {
        let backup = if path.is_file() {
            let dest = self.wal_dir.join(format!("{op_id}.bak"));
            write_atomic(&self.wal_dir, &dest, &fs::read(path)?)?;
            Some(dest)
        } else {
            None
        };
        Ok(RollbackStep::RestoreFile {
            path: path.to_path_buf(),
            backup,
        })
    }

    /// Commit (remove) a WAL entry once the operation has finished.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        let backup = self.wal_dir.join(format!("{op_id}.bak"));
        if backup.exists() {
            fs::remove_file(backup)?;
        }
        Ok(())
    }

    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back all incomplete WAL entries, newest first.
    /// Returns the number of entries rolled back.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let count = entries.len();
        for entry in entries.iter().rev() {
            info!(
                "WAL recovery: rolling back {} of {} (op_id={})",
                entry.kind, entry.subject, entry.op_id
            );
            self.rollback_entry(entry);
            self.commit(&entry.op_id)?;
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn rollback_entry(&self, entry: &WalEntry) {
        let config = ConfigStore::new(self.layout.clone());
        for step in entry.rollback_steps.iter().rev() {
            match step {
                RollbackStep::DiscardStaged => match config.discard_staged() {
                    Ok(true) => debug!("WAL rollback: discarded staged change"),
                    Ok(false) => {}
                    Err(e) => warn!("WAL rollback: failed to discard staged change: {e}"),
                },
                RollbackStep::RestoreConfig { prior } => match config.restore_prior(prior) {
                    Ok(true) => debug!("WAL rollback: restored {} keys", prior.len()),
                    Ok(false) => debug!("WAL rollback: configuration already at prior values"),
                    Err(e) => warn!("WAL rollback: failed to restore configuration: {e}"),
                },
                RollbackStep::RestoreFile { path, backup } => {
                    let result = match backup {
                        Some(backup) => fs::copy(backup, path).map(|_| ()),
                        None if path.exists() => fs::remove_file(path),
                        None => Ok(()),
                    };
                    match result {
                        Ok(()) => debug!("WAL rollback: restored file {}", path.display()),
                        Err(e) => warn!(
                            "WAL rollback: failed to restore file {}: {e}",
                            path.display()
                        ),
                    }
                }
                RollbackStep::Manual { note } => {
                    warn!(
                        "WAL rollback: manual action needed for {} (op_id={}): {note}",
                        entry.kind, entry.op_id
                    );
                }
            }
        }
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entry)?;
        write_atomic(&self.wal_dir, &self.entry_path(&entry.op_id), content.as_bytes())
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_schema::{ConfigChange, KeyPath, TargetSelector};

    fn setup() -> (tempfile::TempDir, StoreLayout, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let wal = WriteAheadLog::new(&layout);
        wal.initialize().unwrap();
        (dir, layout, wal)
    }

    fn key(s: &str) -> KeyPath {
        KeyPath::parse(s).unwrap()
    }

    #[test]
    fn begin_and_commit() {
        let (_dir, _layout, wal) = setup();
        let op_id = wal.begin(WalOpKind::Change, "replica_count").unwrap();
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "replica_count");
        wal.commit(&op_id).unwrap();
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn add_rollback_step_persists() {
        let (_dir, _layout, wal) = setup();
        let op_id = wal.begin(WalOpKind::PackageUpdate, "core").unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::Manual {
                note: "check packages".to_owned(),
            },
        )
        .unwrap();
        assert_eq!(wal.list_incomplete().unwrap()[0].rollback_steps.len(), 1);
    }

    #[test]
    fn recover_discards_stage_and_restores_config() {
        let (_dir, layout, wal) = setup();
        let config = ConfigStore::new(layout.clone());
        config.initialize().unwrap();
        config
            .write(&std::collections::BTreeMap::from([(key("a"), json!(1))]))
            .unwrap();

        let change = ConfigChange::single(key("a"), json!(2), TargetSelector::All);
        let op_id = wal.begin(WalOpKind::Change, "a").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::DiscardStaged)
            .unwrap();
        let snapshot = config.stage(&change).unwrap();
        wal.add_rollback_step(
            &op_id,
            RollbackStep::RestoreConfig {
                prior: snapshot.prior().clone(),
            },
        )
        .unwrap();
        config.commit().unwrap();
        // Crash: no WAL commit.

        assert_eq!(wal.recover().unwrap(), 1);
        assert_eq!(config.read_all().unwrap()[&key("a")], json!(1));
        assert!(!config.is_staged());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn recover_drops_pending_stage() {
        let (_dir, layout, wal) = setup();
        let config = ConfigStore::new(layout.clone());
        let op_id = wal.begin(WalOpKind::Change, "a").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::DiscardStaged)
            .unwrap();
        config
            .stage(&ConfigChange::single(key("a"), json!(1), TargetSelector::All))
            .unwrap();

        wal.recover().unwrap();
        assert!(!config.is_staged());
        assert_eq!(config.version().unwrap(), 0);
    }

    #[test]
    fn recover_restores_stashed_file() {
        let (dir, _layout, wal) = setup();
        let cert = dir.path().join("stx.pem");
        fs::write(&cert, "old cert").unwrap();

        let op_id = wal.begin(WalOpKind::SslCerts, "stx.pem").unwrap();
        let step = wal.stash_file(&op_id, &cert).unwrap();
        wal.add_rollback_step(&op_id, step).unwrap();
        fs::write(&cert, "new cert").unwrap();

        wal.recover().unwrap();
        assert_eq!(fs::read_to_string(&cert).unwrap(), "old cert");
        assert!(!dir
            .path()
            .join("store")
            .join("wal")
            .join(format!("{op_id}.bak"))
            .exists());
    }

    #[test]
    fn recover_removes_file_that_did_not_exist() {
        let (dir, _layout, wal) = setup();
        let cert = dir.path().join("fresh.pem");
        let op_id = wal.begin(WalOpKind::SslCerts, "fresh.pem").unwrap();
        let step = wal.stash_file(&op_id, &cert).unwrap();
        wal.add_rollback_step(&op_id, step).unwrap();
        fs::write(&cert, "new cert").unwrap();

        wal.recover().unwrap();
        assert!(!cert.exists());
    }

    #[test]
    fn recover_with_no_entries_is_noop() {
        let (_dir, _layout, wal) = setup();
        assert_eq!(wal.recover().unwrap(), 0);
    }

    #[test]
    fn recover_corrupt_wal_entry_is_removed() {
        let (dir, _layout, wal) = setup();
        let wal_dir = dir.path().join("store").join("wal");
        fs::write(wal_dir.join("corrupt-op.json"), "THIS IS NOT JSON{{{").unwrap();
        wal.begin(WalOpKind::Change, "a").unwrap();

        assert_eq!(wal.recover().unwrap(), 1);
        assert!(!wal_dir.join("corrupt-op.json").exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn op_kind_display() {
        assert_eq!(WalOpKind::Change.to_string(), "change");
        assert_eq!(WalOpKind::PackageUpdate.to_string(), "package update");
        assert_eq!(WalOpKind::SslCerts.to_string(), "ssl certs");
        assert_eq!(WalOpKind::UpdateRepo.to_string(), "update repo");
    }
}
