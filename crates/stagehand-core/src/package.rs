use crate::concurrency::shutdown_requested;
use crate::coordinator::{close_wal_entry, merge_outputs};
use crate::reversible::{ActionRecord, PackageRollback};
use crate::CoreError;
use serde::Serialize;
use stagehand_runtime::{RemoteExecutor, TargetOutputs};
use stagehand_schema::{PackagesSection, TargetId, TargetSelector, UnitId, ValidationError};
use stagehand_store::{RollbackStep, WalOpKind, WriteAheadLog};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub components: Vec<String>,
    pub targets: Vec<TargetId>,
    pub dry_run: bool,
    pub outputs: TargetOutputs,
}

/// Updates the configured components one after the other under a package
/// checkpoint. The first failing component restores the checkpoint and ends
/// the run.
pub struct PackageUpdater<'a> {
    executor: &'a RemoteExecutor,
    wal: &'a WriteAheadLog,
    packages: &'a PackagesSection,
}

impl<'a> PackageUpdater<'a> {
    pub fn new(
        executor: &'a RemoteExecutor,
        wal: &'a WriteAheadLog,
        packages: &'a PackagesSection,
    ) -> Self {
        Self {
            executor,
            wal,
            packages,
        }
    }

    pub fn run(&self, selector: &TargetSelector, dry_run: bool) -> Result<UpdateReport, CoreError> {
        let components = &self.packages.components;
        if components.is_empty() {
            return Err(ValidationError::NoComponents.into());
        }
        let units = components
            .iter()
            .map(|c| Ok((c.as_str(), self.packages.update_unit(c)?)))
            .collect::<Result<Vec<(&str, UnitId)>, ValidationError>>()?;
        let targets = self.executor.resolve(selector)?;

        if dry_run {
            info!(
                "dry run: would update {} on {} target(s)",
                components.join(", "),
                targets.len()
            );
            return Ok(UpdateReport {
                components: components.clone(),
                targets,
                dry_run: true,
                outputs: TargetOutputs::new(),
            });
        }
        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }

        let op_id = self.wal.begin(WalOpKind::PackageUpdate, &components.join(","))?;
        let result = self
            .wal
            .add_rollback_step(
                &op_id,
                RollbackStep::Manual {
                    note: "packages may be partly updated; roll back to the checkpoint \
                           logged at the start of the update"
                        .to_owned(),
                },
            )
            .map_err(CoreError::from)
            .and_then(|()| self.update_all(&units, &targets));
        let outputs = close_wal_entry(self.wal, &op_id, result)?;

        Ok(UpdateReport {
            components: components.clone(),
            targets,
            dry_run: false,
            outputs,
        })
    }

    fn update_all(
        &self,
        units: &[(&str, UnitId)],
        targets: &[TargetId],
    ) -> Result<TargetOutputs, CoreError> {
        let record = ActionRecord::begin(PackageRollback::new(self.executor, targets.to_vec()))?;
        for (target, checkpoint) in record.snapshot() {
            info!("package checkpoint on {target}: {checkpoint}");
        }

        let mut outputs = TargetOutputs::new();
        for (component, unit) in units {
            info!("updating component {component}");
            match self.executor.apply_to(std::slice::from_ref(unit), targets) {
                Ok(out) => merge_outputs(&mut outputs, out),
                Err(source) => {
                    warn!("update of {component} failed, restoring package checkpoint");
                    return Err(record.unwind(CoreError::ComponentUpdate {
                        component: (*component).to_owned(),
                        source,
                    }));
                }
            }
        }
        record.confirm();
        info!("updated {} component(s)", units.len());
        Ok(outputs)
    }
}
