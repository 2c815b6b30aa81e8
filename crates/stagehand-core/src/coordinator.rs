use crate::concurrency::shutdown_requested;
use crate::lifecycle::{ChangeState, Lifecycle};
use crate::reversible::{ActionRecord, ConfigRollback};
use crate::CoreError;
use serde::Serialize;
use stagehand_runtime::{RemoteExecutor, TargetOutputs};
use stagehand_schema::{ConfigChange, HookSet, TargetId};
use stagehand_store::{ConfigStore, RollbackStep, WalOpKind, WriteAheadLog};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Pre => write!(f, "pre"),
            HookPhase::Post => write!(f, "post"),
        }
    }
}

/// What a finished (or dry-run) change did.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    /// `None` on dry-run.
    pub snapshot_id: Option<String>,
    /// Committed version after the change, or the current one on dry-run.
    pub version: u64,
    pub dry_run: bool,
    pub keys: Vec<String>,
    pub targets: Vec<TargetId>,
    pub outputs: TargetOutputs,
}

/// Drives one configuration change through stage, hooks and commit.
///
/// A failed change leaves the committed configuration as it was before the
/// change, except when the compensation itself fails.
pub struct ChangeCoordinator<'a> {
    store: &'a ConfigStore,
    executor: &'a RemoteExecutor,
    wal: &'a WriteAheadLog,
}

impl<'a> ChangeCoordinator<'a> {
    pub fn new(store: &'a ConfigStore, executor: &'a RemoteExecutor, wal: &'a WriteAheadLog) -> Self {
        Self {
            store,
            executor,
            wal,
        }
    }

    pub fn run(
        &self,
        change: &ConfigChange,
        hooks: &HookSet,
        dry_run: bool,
    ) -> Result<ChangeReport, CoreError> {
        let targets = self.executor.resolve(change.targets())?;
        let keys: Vec<String> = change.keys().map(ToString::to_string).collect();

        if dry_run {
            info!(
                "dry run: would change {} on {} target(s)",
                keys.join(", "),
                targets.len()
            );
            return Ok(ChangeReport {
                snapshot_id: None,
                version: self.store.version()?,
                dry_run: true,
                keys,
                targets,
                outputs: TargetOutputs::new(),
            });
        }
        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }

        info!("staging change of {}", keys.join(", "));
        let op_id = self.wal.begin(WalOpKind::Change, &keys.join(","))?;
        let result = self
            .wal
            .add_rollback_step(&op_id, RollbackStep::DiscardStaged)
            .map_err(CoreError::from)
            .and_then(|()| self.drive(&op_id, change, hooks, &targets));
        let (snapshot_id, version, outputs) = close_wal_entry(self.wal, &op_id, result)?;

        Ok(ChangeReport {
            snapshot_id: Some(snapshot_id),
            version,
            dry_run: false,
            keys,
            targets,
            outputs,
        })
    }

    fn drive(
        &self,
        op_id: &str,
        change: &ConfigChange,
        hooks: &HookSet,
        targets: &[TargetId],
    ) -> Result<(String, u64, TargetOutputs), CoreError> {
        let mut lifecycle = Lifecycle::new();
        let record = ActionRecord::begin(ConfigRollback::new(self.store, change))?;
        lifecycle.advance(ChangeState::Staged)?;

        let prior = record.snapshot().prior().clone();
        let logged = self
            .wal
            .add_rollback_step(op_id, RollbackStep::RestoreConfig { prior })
            .and_then(|()| {
                if hooks.is_empty() {
                    return Ok(());
                }
                self.wal.add_rollback_step(
                    op_id,
                    RollbackStep::Manual {
                        note: format!(
                            "hooks may have partly run on {}; re-apply the current configuration",
                            join_targets(targets)
                        ),
                    },
                )
            });
        if let Err(e) = logged {
            lifecycle.advance(ChangeState::RolledBack)?;
            return Err(record.unwind(e.into()));
        }

        let mut outputs = match self.executor.apply_to(&hooks.pre, targets) {
            Ok(outputs) => outputs,
            Err(source) => {
                warn!("pre hooks failed, compensating: {source}");
                self.compensate_with_post(hooks, targets);
                lifecycle.advance(ChangeState::RolledBack)?;
                return Err(record.unwind(CoreError::Hook {
                    phase: HookPhase::Pre,
                    source,
                }));
            }
        };
        lifecycle.advance(ChangeState::PreHooksApplied)?;

        let version = match self.store.commit() {
            Ok(version) => version,
            Err(e) => {
                warn!("commit failed, restoring snapshot: {e}");
                lifecycle.advance(ChangeState::Restoring)?;
                let err = record.unwind(e.into());
                self.compensate_with_post(hooks, targets);
                lifecycle.advance(ChangeState::RolledBack)?;
                return Err(err);
            }
        };
        lifecycle.advance(ChangeState::Committed)?;

        match self.executor.apply_to(&hooks.post, targets) {
            Ok(post) => merge_outputs(&mut outputs, post),
            Err(source) => {
                warn!("post hooks failed, restoring snapshot: {source}");
                lifecycle.advance(ChangeState::Restoring)?;
                let err = record.unwind(CoreError::Hook {
                    phase: HookPhase::Post,
                    source,
                });
                lifecycle.advance(ChangeState::RolledBack)?;
                return Err(err);
            }
        }
        lifecycle.advance(ChangeState::PostHooksApplied)?;

        let snapshot = record.confirm();
        info!("change {} applied as version {version}", snapshot.id());
        Ok((snapshot.id().to_owned(), version, outputs))
    }

    /// Best effort. A failure here is logged and never replaces the error
    /// being compensated for.
    fn compensate_with_post(&self, hooks: &HookSet, targets: &[TargetId]) {
        if hooks.post.is_empty() {
            return;
        }
        if let Err(e) = self.executor.apply_to(&hooks.post, targets) {
            warn!("compensating post hooks failed: {e}");
        }
    }
}

/// Remove the WAL entry of a finished operation. An entry whose compensation
/// failed stays behind so the next engine start retries the rollback.
pub(crate) fn close_wal_entry<T>(
    wal: &WriteAheadLog,
    op_id: &str,
    result: Result<T, CoreError>,
) -> Result<T, CoreError> {
    match result {
        Err(e @ CoreError::RestoreFailed { .. }) => {
            warn!("keeping WAL entry {op_id} for recovery");
            Err(e)
        }
        Err(e) => {
            if let Err(wal_err) = wal.commit(op_id) {
                warn!("failed to close WAL entry {op_id}: {wal_err}");
            }
            Err(e)
        }
        Ok(value) => {
            wal.commit(op_id)?;
            Ok(value)
        }
    }
}

pub(crate) fn merge_outputs(into: &mut TargetOutputs, from: TargetOutputs) {
    for (target, output) in from {
        let entry = into.entry(target).or_default();
        if !entry.is_empty() && !output.is_empty() {
            entry.push('\n');
        }
        entry.push_str(&output);
    }
}

fn join_targets(targets: &[TargetId]) -> String {
    targets
        .iter()
        .map(TargetId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagehand_runtime::{Inventory, MockBackend, RuntimeError, TargetBackend};
    use stagehand_schema::{KeyPath, TargetSelector, UnitId};
    use stagehand_store::StoreLayout;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<MockBackend>,
        store: ConfigStore,
        executor: RemoteExecutor,
        wal: WriteAheadLog,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = ConfigStore::new(layout.clone());
        store.initialize().unwrap();
        let backend = Arc::new(MockBackend::new());
        let inventory =
            Inventory::new(vec![TargetId::new("node-1"), TargetId::new("node-2")], None).unwrap();
        let executor = RemoteExecutor::new(backend.clone(), inventory, 2);
        let wal = WriteAheadLog::new(&layout);
        Fixture {
            dir,
            backend,
            store,
            executor,
            wal,
        }
    }

    fn key(s: &str) -> KeyPath {
        KeyPath::parse(s).unwrap()
    }

    fn change(k: &str, v: serde_json::Value) -> ConfigChange {
        ConfigChange::single(key(k), v, TargetSelector::All)
    }

    fn hooks(pre: &[&str], post: &[&str]) -> HookSet {
        HookSet::new(
            pre.iter().map(|u| UnitId::new(*u)).collect(),
            post.iter().map(|u| UnitId::new(*u)).collect(),
        )
    }

    #[test]
    fn success_commits_and_runs_hooks_in_order() {
        let f = fixture();
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);
        let report = coordinator
            .run(&change("app/replicas", json!(3)), &hooks(&["prepare"], &["activate"]), false)
            .unwrap();

        assert_eq!(report.version, 1);
        assert_eq!(f.store.read_all().unwrap()[&key("app/replicas")], json!(3));
        assert!(!f.store.is_staged());
        assert!(f.wal.list_incomplete().unwrap().is_empty());
        let node1: Vec<String> = f
            .backend
            .applied()
            .into_iter()
            .filter(|(t, _)| t == "node-1")
            .map(|(_, u)| u)
            .collect();
        assert_eq!(node1, vec!["prepare", "activate"]);
        assert_eq!(
            report.outputs[&TargetId::new("node-2")],
            "mock-apply: prepare\nmock-apply: activate"
        );
    }

    #[test]
    fn pre_failure_leaves_store_unchanged_and_compensates_with_post() {
        let f = fixture();
        f.store
            .write(&BTreeMap::from([(key("app/replicas"), json!(1))]))
            .unwrap();
        f.backend.fail_on("prepare", Some("node-1"));
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);

        let err = coordinator
            .run(&change("app/replicas", json!(3)), &hooks(&["prepare"], &["activate"]), false)
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::Hook {
                phase: HookPhase::Pre,
                ..
            }
        ));
        assert_eq!(f.store.read_all().unwrap()[&key("app/replicas")], json!(1));
        assert_eq!(f.store.version().unwrap(), 1);
        assert!(!f.store.is_staged());
        let activated = f.backend.applied().iter().filter(|(_, u)| u == "activate").count();
        assert_eq!(activated, 2);
    }

    #[test]
    fn compensating_post_failure_does_not_mask_pre_error() {
        let f = fixture();
        f.backend.fail_on("prepare", None);
        f.backend.fail_on("activate", None);
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);

        let err = coordinator
            .run(&change("a/b", json!(true)), &hooks(&["prepare"], &["activate"]), false)
            .unwrap_err();
        assert!(err.to_string().contains("prepare"));
        assert!(matches!(err, CoreError::Hook { phase: HookPhase::Pre, .. }));
    }

    #[test]
    fn post_failure_restores_prior_value() {
        let f = fixture();
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);
        f.backend.fail_on("activate", Some("node-2"));

        let err = coordinator
            .run(&change("app/new_key", json!("x")), &hooks(&[], &["activate"]), false)
            .unwrap_err();

        assert!(matches!(err, CoreError::Hook { phase: HookPhase::Post, .. }));
        assert!(f.store.read_all().unwrap().is_empty());
        assert!(f.wal.list_incomplete().unwrap().is_empty());
    }

    /// Drops the pending stage while "prepare" runs, so the commit fails.
    struct DropStage {
        staged_file: std::path::PathBuf,
        inner: MockBackend,
    }

    impl TargetBackend for DropStage {
        fn name(&self) -> &str {
            "drop-stage"
        }

        fn available(&self) -> bool {
            true
        }

        fn apply_unit(
            &self,
            target: &TargetId,
            unit: &UnitId,
        ) -> Result<String, RuntimeError> {
            if unit == "prepare" && self.staged_file.exists() {
                std::fs::remove_file(&self.staged_file)?;
            }
            self.inner.apply_unit(target, unit)
        }

        fn run_command(
            &self,
            target: &TargetId,
            command: &str,
        ) -> Result<String, RuntimeError> {
            self.inner.run_command(target, command)
        }
    }

    #[test]
    fn commit_failure_restores_and_compensates() {
        let f = fixture();
        let backend = Arc::new(DropStage {
            staged_file: StoreLayout::new(f.dir.path()).staged_file(),
            inner: MockBackend::new(),
        });
        let inventory = Inventory::new(vec![TargetId::new("node-1")], None).unwrap();
        let executor = RemoteExecutor::new(backend.clone(), inventory, 1);
        let coordinator = ChangeCoordinator::new(&f.store, &executor, &f.wal);

        let err = coordinator
            .run(&change("app/x", json!(2)), &hooks(&["prepare"], &["activate"]), false)
            .unwrap_err();

        assert!(matches!(err, CoreError::Store(_)));
        assert!(f.store.read_all().unwrap().is_empty());
        let units: Vec<String> = backend.inner.applied().into_iter().map(|(_, u)| u).collect();
        assert_eq!(units, vec!["prepare", "activate"]);
        assert!(f.wal.list_incomplete().unwrap().is_empty());
    }

    /// Fails "activate" after tampering with the committed document, so the
    /// snapshot restore cannot read it either.
    struct CorruptOnActivate {
        config_file: std::path::PathBuf,
        inner: MockBackend,
    }

    impl TargetBackend for CorruptOnActivate {
        fn name(&self) -> &str {
            "corrupt-on-activate"
        }

        fn available(&self) -> bool {
            true
        }

        fn apply_unit(
            &self,
            target: &TargetId,
            unit: &UnitId,
        ) -> Result<String, RuntimeError> {
            if unit == "activate" {
                let content = std::fs::read_to_string(&self.config_file)?;
                std::fs::write(&self.config_file, content.replace("\"x\"", "\"y\""))?;
            }
            self.inner.apply_unit(target, unit)
        }

        fn run_command(
            &self,
            target: &TargetId,
            command: &str,
        ) -> Result<String, RuntimeError> {
            self.inner.run_command(target, command)
        }
    }

    #[test]
    fn failed_restore_reports_both_errors_and_keeps_wal_entry() {
        let f = fixture();
        let backend = Arc::new(CorruptOnActivate {
            config_file: StoreLayout::new(f.dir.path()).config_file(),
            inner: MockBackend::new(),
        });
        backend.inner.fail_on("activate", None);
        let inventory = Inventory::new(vec![TargetId::new("node-1")], None).unwrap();
        let executor = RemoteExecutor::new(backend, inventory, 1);
        let coordinator = ChangeCoordinator::new(&f.store, &executor, &f.wal);

        let err = coordinator
            .run(&change("app/new_key", json!("x")), &hooks(&[], &["activate"]), false)
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Restore);
        assert!(matches!(err, CoreError::RestoreFailed { .. }));
        let msg = err.to_string();
        assert!(msg.contains("post hooks failed"), "{msg}");
        assert!(msg.contains("activate"), "{msg}");
        assert!(msg.contains("integrity check failed"), "{msg}");
        assert_eq!(f.wal.list_incomplete().unwrap().len(), 1);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let f = fixture();
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);
        let report = coordinator
            .run(&change("app/replicas", json!(3)), &hooks(&["prepare"], &["activate"]), true)
            .unwrap();
        assert!(report.dry_run);
        assert!(report.snapshot_id.is_none());
        assert_eq!(report.targets.len(), 2);
        assert!(f.store.read_all().unwrap().is_empty());
        assert!(f.backend.attempts().is_empty());
    }

    #[test]
    fn unknown_target_is_rejected_before_staging() {
        let f = fixture();
        let coordinator = ChangeCoordinator::new(&f.store, &f.executor, &f.wal);
        let c = ConfigChange::single(
            key("a/b"),
            json!(1),
            TargetSelector::One(TargetId::new("ghost")),
        );
        assert!(coordinator.run(&c, &HookSet::default(), false).is_err());
        assert!(!f.store.is_staged());
        assert!(f.wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn merge_outputs_joins_lines() {
        let mut into = TargetOutputs::from([(TargetId::new("n"), "a".to_owned())]);
        merge_outputs(&mut into, TargetOutputs::from([(TargetId::new("n"), "b".to_owned())]));
        assert_eq!(into[&TargetId::new("n")], "a\nb");
    }
}
