use crate::backend::TargetBackend;
use crate::RuntimeError;
use stagehand_schema::{MockSection, TargetId, UnitId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

type PackageState = BTreeMap<String, u32>;

#[derive(Default)]
struct MockState {
    /// Entries `unit@target`, or a bare `unit` failing everywhere.
    failing: BTreeSet<String>,
    attempts: Vec<(TargetId, String)>,
    applied: Vec<(TargetId, String)>,
    packages: BTreeMap<TargetId, PackageState>,
    checkpoints: BTreeMap<String, PackageState>,
}

/// In-memory backend with deterministic output and injectable failures.
///
/// Units ending in `.update` count as package updates: each successful
/// application bumps that unit's package version on the target, and package
/// checkpoints capture and restore those versions.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(section: &MockSection) -> Self {
        let backend = Self::new();
        if let Ok(mut state) = backend.state.lock() {
            state.failing.extend(section.failing.iter().cloned());
        }
        backend
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    /// Make `work` (a unit id or command) fail, on one target or on all.
    pub fn fail_on(&self, work: &str, target: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(match target {
                Some(t) => format!("{work}@{t}"),
                None => work.to_owned(),
            });
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.clear();
        }
    }

    /// Every unit or command attempted, in call order.
    pub fn attempts(&self) -> Vec<(TargetId, String)> {
        self.state
            .lock()
            .map(|s| s.attempts.clone())
            .unwrap_or_default()
    }

    /// Successful applications and commands, in call order.
    pub fn applied(&self) -> Vec<(TargetId, String)> {
        self.state
            .lock()
            .map(|s| s.applied.clone())
            .unwrap_or_default()
    }

    pub fn package_version(&self, target: &str, unit: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.packages
                    .get(&TargetId::new(target))
                    .and_then(|p| p.get(unit).copied())
            })
            .unwrap_or(0)
    }

    fn attempt(&self, target: &TargetId, work: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.attempts.push((target.clone(), work.to_owned()));
        if state.failing.contains(work) || state.failing.contains(&format!("{work}@{target}")) {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: '{work}' failed on {target}"
            )));
        }
        state.applied.push((target.clone(), work.to_owned()));
        Ok(())
    }
}

impl TargetBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn apply_unit(&self, target: &TargetId, unit: &UnitId) -> Result<String, RuntimeError> {
        self.attempt(target, unit)?;
        if unit.ends_with(".update") {
            let mut state = self.lock()?;
            *state
                .packages
                .entry(target.clone())
                .or_default()
                .entry(unit.to_string())
                .or_default() += 1;
        }
        Ok(format!("mock-apply: {unit}"))
    }

    fn run_command(&self, target: &TargetId, command: &str) -> Result<String, RuntimeError> {
        self.attempt(target, command)?;
        Ok(format!("mock-run: {command}"))
    }

    fn package_checkpoint(&self, target: &TargetId) -> Result<String, RuntimeError> {
        let mut state = self.lock()?;
        let id = format!("mock-ckpt-{target}-{}", state.checkpoints.len());
        let current = state.packages.get(target).cloned().unwrap_or_default();
        state.checkpoints.insert(id.clone(), current);
        Ok(id)
    }

    fn package_rollback(&self, target: &TargetId, checkpoint: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let saved = state
            .checkpoints
            .get(checkpoint)
            .cloned()
            .ok_or_else(|| RuntimeError::ExecFailed(format!("unknown checkpoint {checkpoint}")))?;
        state.packages.insert(target.clone(), saved);
        state
            .applied
            .push((target.clone(), format!("rollback {checkpoint}")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> TargetId {
        TargetId::new(id)
    }

    #[test]
    fn apply_is_deterministic_and_logged() {
        let backend = MockBackend::new();
        let out = backend
            .apply_unit(&node("node-1"), &UnitId::new("activate"))
            .unwrap();
        assert_eq!(out, "mock-apply: activate");
        assert_eq!(
            backend.applied(),
            vec![(node("node-1"), "activate".to_owned())]
        );
    }

    #[test]
    fn failures_by_target_or_everywhere() {
        let backend = MockBackend::from_settings(&MockSection {
            failing: vec!["activate@node-2".to_owned()],
        });
        let unit = UnitId::new("activate");
        assert!(backend.apply_unit(&node("node-1"), &unit).is_ok());
        assert!(backend.apply_unit(&node("node-2"), &unit).is_err());

        backend.fail_on("uptime", None);
        assert!(backend.run_command(&node("node-1"), "uptime").is_err());
        assert_eq!(backend.attempts().len(), 3);
        assert_eq!(backend.applied().len(), 1);

        backend.clear_failures();
        assert!(backend.apply_unit(&node("node-2"), &unit).is_ok());
    }

    #[test]
    fn checkpoints_restore_package_versions() {
        let backend = MockBackend::new();
        let target = node("node-1");
        let unit = UnitId::new("components.core.update");
        backend.apply_unit(&target, &unit).unwrap();
        let ckpt = backend.package_checkpoint(&target).unwrap();
        backend.apply_unit(&target, &unit).unwrap();
        assert_eq!(backend.package_version("node-1", "components.core.update"), 2);

        backend.package_rollback(&target, &ckpt).unwrap();
        assert_eq!(backend.package_version("node-1", "components.core.update"), 1);
        assert!(backend.package_rollback(&target, "bogus").is_err());
    }
}
