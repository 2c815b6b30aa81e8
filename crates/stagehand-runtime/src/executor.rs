use crate::backend::TargetBackend;
use crate::inventory::Inventory;
use crate::{RuntimeError, TargetFailure};
use rayon::prelude::*;
use stagehand_schema::{JobAction, JobRequest, TargetId, TargetSelector, UnitId};
use stagehand_store::{Job, JobOutcome, JobTracker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Output per target, one line per step.
pub type TargetOutputs = BTreeMap<TargetId, String>;

/// Fans steps out across targets through a [`TargetBackend`].
///
/// A step is one unit or command on every resolved target. Targets of a
/// step run in parallel on a bounded pool and the step returns only after
/// all of them answered. Steps run strictly in order and stop at the first
/// one with a failing target.
#[derive(Clone)]
pub struct RemoteExecutor {
    backend: Arc<dyn TargetBackend>,
    inventory: Arc<Inventory>,
    parallelism: usize,
}

impl RemoteExecutor {
    pub fn new(backend: Arc<dyn TargetBackend>, inventory: Inventory, parallelism: usize) -> Self {
        Self {
            backend,
            inventory: Arc::new(inventory),
            parallelism: parallelism.max(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TargetBackend> {
        &self.backend
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn resolve(&self, selector: &TargetSelector) -> Result<Vec<TargetId>, RuntimeError> {
        self.inventory.resolve(selector)
    }

    fn fan_out<F>(
        &self,
        targets: &[TargetId],
        op: F,
    ) -> Result<Vec<(TargetId, Result<String, RuntimeError>)>, RuntimeError>
    where
        F: Fn(&TargetId) -> Result<String, RuntimeError> + Sync,
    {
        if targets.len() <= 1 || self.parallelism == 1 {
            return Ok(targets.iter().map(|t| (t.clone(), op(t))).collect());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism.min(targets.len()))
            .build()
            .map_err(|e| RuntimeError::Pool(e.to_string()))?;
        Ok(pool.install(|| {
            targets
                .par_iter()
                .map(|t| (t.clone(), op(t)))
                .collect()
        }))
    }

    /// Run one step on every target and fold the answers.
    fn step<F>(&self, step: &str, targets: &[TargetId], op: F) -> Result<TargetOutputs, RuntimeError>
    where
        F: Fn(&TargetId) -> Result<String, RuntimeError> + Sync,
    {
        let mut outputs = TargetOutputs::new();
        let mut failures = Vec::new();
        for (target, result) in self.fan_out(targets, op)? {
            match result {
                Ok(output) => {
                    outputs.insert(target, output);
                }
                Err(e) => failures.push(TargetFailure {
                    target,
                    error: e.to_string(),
                }),
            }
        }
        if failures.is_empty() {
            debug!("step '{step}' succeeded on {} targets", outputs.len());
            Ok(outputs)
        } else {
            Err(RuntimeError::RemoteExecution {
                step: step.to_owned(),
                failures,
            })
        }
    }

    /// Apply units in order on the selected targets.
    pub fn apply_sequence(
        &self,
        units: &[UnitId],
        selector: &TargetSelector,
    ) -> Result<TargetOutputs, RuntimeError> {
        let targets = self.resolve(selector)?;
        self.apply_to(units, &targets)
    }

    /// Apply units in order on already resolved targets.
    pub fn apply_to(
        &self,
        units: &[UnitId],
        targets: &[TargetId],
    ) -> Result<TargetOutputs, RuntimeError> {
        let mut combined = TargetOutputs::new();
        for unit in units {
            info!("applying {unit} on {} target(s)", targets.len());
            let outputs = self.step(unit, targets, |t| self.backend.apply_unit(t, unit))?;
            merge(&mut combined, outputs);
        }
        Ok(combined)
    }

    pub fn run_command(
        &self,
        command: &str,
        selector: &TargetSelector,
    ) -> Result<TargetOutputs, RuntimeError> {
        let targets = self.resolve(selector)?;
        info!("running command on {} target(s)", targets.len());
        self.step(command, &targets, |t| self.backend.run_command(t, command))
    }

    /// Run a command on the local node only.
    pub fn run_local(&self, command: &str) -> Result<String, RuntimeError> {
        self.run_local_as(command, command)
    }

    /// Like [`run_local`](Self::run_local), but errors name the step by
    /// `label` instead of the command line, which may carry credentials.
    pub fn run_local_as(&self, label: &str, command: &str) -> Result<String, RuntimeError> {
        let local = self.inventory.local().clone();
        let mut outputs = self.step(label, std::slice::from_ref(&local), |t| {
            self.backend.run_command(t, command)
        })?;
        Ok(outputs.remove(&local).unwrap_or_default())
    }

    pub fn package_checkpoints(&self, targets: &[TargetId]) -> Result<TargetOutputs, RuntimeError> {
        self.step("package checkpoint", targets, |t| {
            self.backend.package_checkpoint(t)
        })
    }

    pub fn package_rollback(&self, checkpoints: &TargetOutputs) -> Result<(), RuntimeError> {
        let targets: Vec<TargetId> = checkpoints.keys().cloned().collect();
        self.step("package rollback", &targets, |t| {
            let checkpoint = checkpoints.get(t).map_or("", String::as_str);
            self.backend.package_rollback(t, checkpoint).map(|()| String::new())
        })?;
        Ok(())
    }

    /// Run a job request to completion and fold the result into an outcome.
    pub fn execute(&self, request: &JobRequest) -> JobOutcome {
        let result = match &request.action {
            JobAction::ApplyUnits { units } => self.apply_sequence(units, &request.targets),
            JobAction::RunCommand { command } => self.run_command(command, &request.targets),
        };
        match result {
            Ok(outputs) => JobOutcome::succeeded(outputs),
            Err(e) => JobOutcome::failed(e.to_string(), TargetOutputs::new()),
        }
    }

    /// Register a job and execute it on a worker thread. Returns immediately.
    pub fn submit_async(
        &self,
        request: JobRequest,
        tracker: Arc<JobTracker>,
    ) -> Result<(Job, JoinHandle<()>), RuntimeError> {
        let job = Job::new(request);
        tracker.register(&job)?;
        let executor = self.clone();
        let id = job.id.clone();
        let request = job.request.clone();
        let handle = std::thread::spawn(move || {
            let outcome = executor.execute(&request);
            if let Err(e) = tracker.complete(&id, outcome) {
                error!("failed to record result of job {id}: {e}");
            }
        });
        info!("submitted job {}: {}", job.id, job.request.action);
        Ok((job, handle))
    }
}

fn merge(combined: &mut TargetOutputs, outputs: TargetOutputs) {
    for (target, output) in outputs {
        let entry = combined.entry(target).or_default();
        if !entry.is_empty() {
            entry.push('\n');
        }
        entry.push_str(&output);
    }
}
