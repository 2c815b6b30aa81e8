use crate::concurrency::{shutdown_requested, StoreLock};
use crate::coordinator::{close_wal_entry, ChangeCoordinator, ChangeReport, HookPhase};
use crate::package::{PackageUpdater, UpdateReport};
use crate::reversible::{ActionRecord, FileRollback};
use crate::CoreError;
use serde::Serialize;
use serde_json::Value;
use stagehand_runtime::shell::shell_quote;
use stagehand_runtime::{select_backend, Inventory, RemoteExecutor, TargetBackend, TargetOutputs};
use stagehand_schema::{
    CommandRegistry, ConfigChange, HookSet, JobId, JobRequest, KeyPath, RepoSource, Settings,
    TargetId, TargetSelector, UnitId, ValidationError,
};
use stagehand_store::{
    ConfigStore, Job, JobOutcome, JobTracker, RollbackStep, StoreError, StoreLayout, WalOpKind,
    WriteAheadLog,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Values per resolved target.
pub type TargetValues<V> = BTreeMap<TargetId, BTreeMap<KeyPath, V>>;

#[derive(Debug, Clone, Serialize)]
pub struct SslReport {
    pub dest: PathBuf,
    pub units: Vec<UnitId>,
    pub targets: Vec<TargetId>,
    pub dry_run: bool,
    pub outputs: TargetOutputs,
}

/// Central orchestration engine for Stagehand.
///
/// Owns the store, the command registry and the remote executor, and exposes
/// every operation the CLI offers. Mutating operations hold the store lock
/// for their whole duration.
pub struct Engine {
    layout: StoreLayout,
    settings: Settings,
    registry: CommandRegistry,
    config: ConfigStore,
    wal: WriteAheadLog,
    jobs: Arc<JobTracker>,
    executor: RemoteExecutor,
}

impl Engine {
    /// Open the store at `store_root` with the backend named in the settings.
    pub fn new(store_root: impl Into<PathBuf>, settings: Settings) -> Result<Self, CoreError> {
        let backend = select_backend(&settings)?;
        Self::with_backend(store_root, settings, backend)
    }

    /// Open the store with an explicit backend.
    ///
    /// Incomplete WAL entries from earlier runs are rolled back first, unless
    /// another process holds the store lock.
    pub fn with_backend(
        store_root: impl Into<PathBuf>,
        settings: Settings,
        backend: Arc<dyn TargetBackend>,
    ) -> Result<Self, CoreError> {
        settings.validate()?;
        let registry = CommandRegistry::from_settings(&settings)?;
        let inventory = Inventory::from_settings(&settings.inventory)?;
        if !backend.available() {
            return Err(stagehand_runtime::RuntimeError::BackendUnavailable(
                backend.name().to_owned(),
            )
            .into());
        }
        let executor = RemoteExecutor::new(backend, inventory, settings.runtime.parallelism);

        let layout = StoreLayout::new(store_root.into());
        layout.initialize()?;
        let config = ConfigStore::new(layout.clone());
        let wal = WriteAheadLog::new(&layout);
        let jobs = Arc::new(JobTracker::new(&layout));

        match StoreLock::try_acquire(&layout.lock_file()) {
            Ok(Some(_lock)) => {
                match wal.recover() {
                    Ok(0) => {}
                    Ok(n) => info!("recovered {n} interrupted operation(s)"),
                    Err(e) => warn!("WAL recovery failed: {e}"),
                }
                config.initialize()?;
            }
            Ok(None) => debug!("store lock held; skipping WAL recovery"),
            Err(e) => warn!("store lock check failed; skipping WAL recovery: {e}"),
        }

        Ok(Self {
            layout,
            settings,
            registry,
            config,
            wal,
            jobs,
            executor,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    fn lock(&self) -> Result<StoreLock, CoreError> {
        StoreLock::acquire(&self.layout.lock_file())
    }

    fn coordinator(&self) -> ChangeCoordinator<'_> {
        ChangeCoordinator::new(&self.config, &self.executor, &self.wal)
    }

    /// Full committed configuration, per resolved target.
    pub fn dump(&self, selector: &TargetSelector) -> Result<TargetValues<Value>, CoreError> {
        let targets = self.executor.resolve(selector)?;
        let values = self.config.read_all()?;
        Ok(targets.into_iter().map(|t| (t, values.clone())).collect())
    }

    /// Selected keys per resolved target. Absent keys read as `None`.
    pub fn get(
        &self,
        keys: &[KeyPath],
        selector: &TargetSelector,
    ) -> Result<TargetValues<Option<Value>>, CoreError> {
        let targets = self.executor.resolve(selector)?;
        let values = self.config.read(keys)?;
        Ok(targets.into_iter().map(|t| (t, values.clone())).collect())
    }

    pub fn run_change(
        &self,
        change: &ConfigChange,
        hooks: &HookSet,
        dry_run: bool,
    ) -> Result<ChangeReport, CoreError> {
        let _lock = if dry_run { None } else { Some(self.lock()?) };
        self.coordinator().run(change, hooks, dry_run)
    }

    /// Apply `key=value` assignments through a registered `set` command.
    pub fn set<S: AsRef<str>>(
        &self,
        command: &str,
        assignments: &[S],
        selector: TargetSelector,
        dry_run: bool,
    ) -> Result<ChangeReport, CoreError> {
        let spec = self.registry.get(command)?;
        let change = spec.build_change(assignments, selector)?;
        info!("set via '{command}': {} key(s)", change.values().len());
        self.run_change(&change, &spec.hooks, dry_run)
    }

    /// Register (or with no source, remove) an update repository for
    /// `release`. Local sources are copied under `<file_roots>/repos` first.
    pub fn set_update_repo(
        &self,
        release: &str,
        source: Option<&str>,
        selector: TargetSelector,
        dry_run: bool,
    ) -> Result<ChangeReport, CoreError> {
        let spec = self.registry.update_repo()?;
        let source = RepoSource::classify(source)?;
        let change = spec.build_repo_change(release, &source, selector)?;
        if dry_run {
            return self.coordinator().run(&change, &spec.hooks, true);
        }
        self.executor.resolve(change.targets())?;

        let _lock = self.lock()?;
        if let Some(command) = self.repo_copy_command(release, &source) {
            if shutdown_requested() {
                return Err(CoreError::Interrupted);
            }
            let op_id = self.wal.begin(WalOpKind::UpdateRepo, release)?;
            let result = self
                .wal
                .add_rollback_step(
                    &op_id,
                    RollbackStep::Manual {
                        note: format!("repository copy for {release} may be incomplete"),
                    },
                )
                .map_err(CoreError::from)
                .and_then(|()| Ok(self.executor.run_local(&command)?));
            close_wal_entry(&self.wal, &op_id, result)?;
            info!("copied repository for {release}");
        }
        self.coordinator().run(&change, &spec.hooks, false)
    }

    fn repo_copy_command(&self, release: &str, source: &RepoSource) -> Option<String> {
        let repos = self.settings.paths.file_roots.join("repos");
        let quote = |p: &Path| shell_quote(&p.to_string_lossy());
        match source {
            RepoSource::Directory(src) => {
                let dest = repos.join(release);
                Some(format!(
                    "mkdir -p {repos} && rm -rf {dest} && cp -R {src} {dest}",
                    repos = quote(&repos),
                    dest = quote(&dest),
                    src = quote(src),
                ))
            }
            RepoSource::Iso(src) => {
                let dest = repos.join(format!("{release}.iso"));
                Some(format!(
                    "mkdir -p {repos} && cp {src} {dest}",
                    repos = quote(&repos),
                    dest = quote(&dest),
                    src = quote(src),
                ))
            }
            RepoSource::Url(_) | RepoSource::Remove => None,
        }
    }

    /// Update every configured component, in order, under a package
    /// checkpoint.
    pub fn run_package_update(
        &self,
        selector: &TargetSelector,
        dry_run: bool,
    ) -> Result<UpdateReport, CoreError> {
        let _lock = if dry_run { None } else { Some(self.lock()?) };
        PackageUpdater::new(&self.executor, &self.wal, &self.settings.packages)
            .run(selector, dry_run)
    }

    /// Flash the storage controller firmware from a local image.
    ///
    /// Credentials come from the configuration store and are never logged.
    pub fn fw_update(&self, source: &Path, dry_run: bool) -> Result<String, CoreError> {
        if !source.is_file() {
            return Err(ValidationError::Source(format!(
                "firmware image '{}' is not a file",
                source.display()
            ))
            .into());
        }
        let base = &self.settings.firmware.controller_key;
        let ip = self.controller_setting(base, "primary_mc/ip")?;
        let user = self.controller_setting(base, "user")?;
        let password = self.controller_setting(base, "password")?;
        let script = self.settings.paths.file_roots.join(&self.settings.firmware.script);

        if dry_run {
            return Ok(format!(
                "would update controller {ip} firmware from {}",
                source.display()
            ));
        }
        info!("updating controller {ip} firmware from {}", source.display());
        let command = format!(
            "{} host -h {} -u {} -p {} --update-fw {}",
            shell_quote(&script.to_string_lossy()),
            shell_quote(&ip),
            shell_quote(&user),
            shell_quote(&password),
            shell_quote(&source.to_string_lossy()),
        );
        Ok(self.executor.run_local_as("firmware update", &command)?)
    }

    fn controller_setting(&self, base: &KeyPath, tail: &str) -> Result<String, CoreError> {
        let key = base.join(tail)?;
        let values = self.config.read([&key])?;
        match values.get(&key).cloned().flatten() {
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(Value::Null) | None => Err(ValidationError::MissingSetting(key.to_string()).into()),
            Some(Value::String(_)) => Err(ValidationError::MissingSetting(key.to_string()).into()),
            Some(other) => Ok(other.to_string()),
        }
    }

    /// Install a certificate bundle and apply the ssl unit on every target.
    /// The previous bundle comes back if any step fails.
    pub fn set_ssl_certs(
        &self,
        source: &Path,
        restart: bool,
        dry_run: bool,
    ) -> Result<SslReport, CoreError> {
        if !source.is_file() {
            return Err(ValidationError::Source(format!(
                "certificate '{}' is not a file",
                source.display()
            ))
            .into());
        }
        let ssl = &self.settings.ssl;
        let mut units = vec![ssl.unit.clone()];
        if restart {
            let restart_unit = ssl
                .restart_unit
                .clone()
                .ok_or_else(|| ValidationError::MissingSetting("ssl.restart_unit".to_owned()))?;
            units.push(restart_unit);
        }
        let dest = self.settings.paths.file_roots.join(&ssl.dest);
        let targets = self.executor.resolve(&TargetSelector::All)?;

        let mut report = SslReport {
            dest,
            units,
            targets,
            dry_run,
            outputs: TargetOutputs::new(),
        };
        if dry_run {
            return Ok(report);
        }
        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }

        let _lock = self.lock()?;
        let op_id = self
            .wal
            .begin(WalOpKind::SslCerts, &report.dest.to_string_lossy())?;
        let result = self.install_certs(&op_id, source, &report);
        report.outputs = close_wal_entry(&self.wal, &op_id, result)?;
        Ok(report)
    }

    fn install_certs(
        &self,
        op_id: &str,
        source: &Path,
        report: &SslReport,
    ) -> Result<TargetOutputs, CoreError> {
        let step = self.wal.stash_file(op_id, &report.dest)?;
        self.wal.add_rollback_step(op_id, step)?;
        let record = ActionRecord::begin(FileRollback::new(&report.dest))?;

        let copied = report
            .dest
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::copy(source, &report.dest).map(|_| ()));
        if let Err(e) = copied {
            return Err(record.unwind(e.into()));
        }
        debug!("installed {}", report.dest.display());

        match self.executor.apply_to(&report.units, &report.targets) {
            Ok(outputs) => {
                record.confirm();
                info!("certificates applied on {} target(s)", report.targets.len());
                Ok(outputs)
            }
            Err(source) => Err(record.unwind(CoreError::Hook {
                phase: HookPhase::Post,
                source,
            })),
        }
    }

    /// Validate and register a job without running it.
    pub fn submit(&self, request: JobRequest) -> Result<Job, CoreError> {
        self.executor.resolve(&request.targets)?;
        let job = Job::new(request);
        self.jobs.register(&job)?;
        info!("registered job {}: {}", job.id, job.request.action);
        Ok(job)
    }

    /// Register a job and run it on a worker thread. Returns immediately.
    pub fn submit_async(&self, request: JobRequest) -> Result<(Job, JoinHandle<()>), CoreError> {
        self.executor.resolve(&request.targets)?;
        Ok(self.executor.submit_async(request, Arc::clone(&self.jobs))?)
    }

    /// Run a registered job to completion and record its outcome.
    pub fn run_job(&self, id: &JobId) -> Result<JobOutcome, CoreError> {
        let job = self.jobs.get(id).map_err(job_error)?;
        if job.is_complete() {
            return Err(StoreError::JobAlreadyCompleted(id.to_string()).into());
        }
        let outcome = self.executor.execute(&job.request);
        self.jobs.complete(id, outcome.clone())?;
        Ok(outcome)
    }

    pub fn get_job_result(&self, id: &JobId) -> Result<JobOutcome, CoreError> {
        self.jobs.resolve(id).map_err(job_error)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, CoreError> {
        Ok(self.jobs.list()?)
    }
}

fn job_error(e: StoreError) -> CoreError {
    match e {
        StoreError::JobNotFound(id) => CoreError::JobNotFound(id),
        StoreError::JobPending(id) => CoreError::JobPending(id),
        other => other.into(),
    }
}
