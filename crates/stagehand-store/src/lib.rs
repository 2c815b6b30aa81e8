//! Durable state for Stagehand.
//!
//! This crate provides the storage layer: the versioned `ConfigStore` with its
//! stage/commit/rollback cycle, `StoreLayout` for directory structure
//! management, the `WriteAheadLog` used for crash recovery, and the
//! `JobTracker` that persists asynchronous job results.

pub mod config;
pub mod jobs;
pub mod layout;
pub mod wal;

pub use config::{ConfigDocument, ConfigSnapshot, ConfigStore, StagedChange};
pub use jobs::{Job, JobOutcome, JobTracker};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use wal::{RollbackStep, WalEntry, WalOpKind, WriteAheadLog};

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` through a temp file in `dir`: write, fsync,
/// rename, fsync the directory. Readers see either the old or the new file.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Documents that carry an embedded blake3 checksum over their own content.
pub(crate) trait Checksummed: Serialize + Clone {
    fn checksum_slot(&mut self) -> &mut Option<String>;

    /// Checksum over the document with the checksum field cleared.
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        *copy.checksum_slot() = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    fn sealed(&self) -> Result<Self, StoreError> {
        let mut copy = self.clone();
        *copy.checksum_slot() = Some(self.compute_checksum()?);
        Ok(copy)
    }

    /// Every document this store writes is sealed, so a missing checksum is
    /// treated like a wrong one.
    fn verify(&mut self, document: &str) -> Result<(), StoreError> {
        let Some(expected) = self.checksum_slot().clone() else {
            return Err(StoreError::IntegrityFailure {
                document: document.to_owned(),
                expected: "a checksum".to_owned(),
                actual: "none".to_owned(),
            });
        };
        let actual = self.compute_checksum()?;
        if actual == expected {
            Ok(())
        } else {
            Err(StoreError::IntegrityFailure {
                document: document.to_owned(),
                expected,
                actual,
            })
        }
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Time-ordered opaque id: `<utc timestamp ms>-<8 hex>`.
///
/// The hex part mixes `seed` with the process id and a per-process counter so
/// that ids minted in the same millisecond stay distinct.
pub fn new_op_id(seed: &str) -> String {
    let now = chrono::Utc::now();
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed.as_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(&now.timestamp_subsec_nanos().to_le_bytes());
    format!(
        "{}-{}",
        now.format("%Y%m%d%H%M%S%3f"),
        &hasher.finalize().to_hex()[..8]
    )
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store integrity check failed for '{document}': expected {expected}, got {actual}")]
    IntegrityFailure {
        document: String,
        expected: String,
        actual: String,
    },
    #[error("state error: no staged change to commit")]
    NotStaged,
    #[error("state error: change {snapshot_id} is already staged")]
    AlreadyStaged { snapshot_id: String },
    #[error("state error: staged change was based on version {base}, store is at version {current}")]
    StaleStage { base: u64, current: u64 },
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job pending: {0} has not completed yet")]
    JobPending(String),
    #[error("state error: job {0} is already completed")]
    JobAlreadyCompleted(String),
    #[error("store lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_ids_are_distinct_and_sortable() {
        let a = new_op_id("same");
        let b = new_op_id("same");
        assert_ne!(a, b);
        assert_eq!(a.len(), 17 + 1 + 8);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-'));
    }

    #[test]
    fn store_error_display_stale_stage() {
        let e = StoreError::StaleStage { base: 3, current: 4 };
        let msg = e.to_string();
        assert!(msg.starts_with("state error"));
        assert!(msg.contains('3'));
        assert!(msg.contains('4'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            document: "config.json".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("config.json"));
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("doc.json");
        write_atomic(dir.path(), &dest, b"one").unwrap();
        write_atomic(dir.path(), &dest, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "two");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
