use crate::layout::StoreLayout;
use crate::{new_op_id, write_atomic, Checksummed, StoreError};
use serde::{Deserialize, Serialize};
use stagehand_schema::{JobId, JobRequest, TargetId};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    /// Output per target that responded.
    pub outputs: BTreeMap<TargetId, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: String,
}

impl JobOutcome {
    pub fn succeeded(outputs: BTreeMap<TargetId, String>) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn failed(error: impl Into<String>, outputs: BTreeMap<TargetId, String>) -> Self {
        Self {
            success: false,
            outputs,
            error: Some(error.into()),
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub submitted_at: String,
    pub request: JobRequest,
    /// Empty until the job completes; written exactly once.
    #[serde(default)]
    pub result: Option<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let id = JobId::new(new_op_id(&request.action.to_string()));
        Self {
            id,
            submitted_at: chrono::Utc::now().to_rfc3339(),
            request,
            result: None,
            checksum: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

impl Checksummed for Job {
    fn checksum_slot(&mut self) -> &mut Option<String> {
        &mut self.checksum
    }
}

/// Persistent job records under `store/jobs/<id>.json`.
///
/// Records are never deleted. Completion happens once; reads are
/// side-effect free.
pub struct JobTracker {
    jobs_dir: PathBuf,
}

impl JobTracker {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            jobs_dir: layout.jobs_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.jobs_dir)?;
        Ok(())
    }

    pub fn register(&self, job: &Job) -> Result<(), StoreError> {
        self.put(job)?;
        debug!("registered job {}: {}", job.id, job.request.action);
        Ok(())
    }

    /// Record the outcome of a job. A second completion is refused.
    pub fn complete(&self, id: &JobId, outcome: JobOutcome) -> Result<Job, StoreError> {
        let mut job = self.get(id)?;
        if job.is_complete() {
            return Err(StoreError::JobAlreadyCompleted(id.to_string()));
        }
        job.result = Some(outcome);
        self.put(&job)?;
        debug!(
            "job {id} completed: {}",
            if job.result.as_ref().is_some_and(|r| r.success) {
                "success"
            } else {
                "failure"
            }
        );
        Ok(job)
    }

    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        // Ids end up in file names; anything malformed cannot name a job.
        if JobId::parse(id).is_err() {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        let path = self.job_path(id);
        if !path.exists() {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        let mut job: Job = serde_json::from_str(&fs::read_to_string(&path)?)?;
        job.verify(&format!("jobs/{id}.json"))?;
        Ok(job)
    }

    /// The outcome of a completed job, `JobPending` before completion,
    /// `JobNotFound` for ids never issued.
    pub fn resolve(&self, id: &JobId) -> Result<JobOutcome, StoreError> {
        self.get(id)?
            .result
            .ok_or_else(|| StoreError::JobPending(id.to_string()))
    }

    /// All readable jobs, oldest first.
    pub fn list(&self) -> Result<Vec<Job>, StoreError> {
        if !self.jobs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(&JobId::new(stem)) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("skipping unreadable job record '{stem}': {e}"),
            }
        }
        jobs.sort_by(|a, b| {
            submitted(a)
                .cmp(&submitted(b))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    fn put(&self, job: &Job) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&job.sealed()?)?;
        write_atomic(&self.jobs_dir, &self.job_path(&job.id), content.as_bytes())
    }
}

fn submitted(job: &Job) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    chrono::DateTime::parse_from_rfc3339(&job.submitted_at).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_schema::{TargetSelector, UnitId};

    fn tracker() -> (tempfile::TempDir, JobTracker) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, JobTracker::new(&layout))
    }

    fn request() -> JobRequest {
        JobRequest::apply_units(vec![UnitId::new("components.system")], TargetSelector::All)
    }

    #[test]
    fn unknown_pending_then_complete() {
        let (_dir, tracker) = tracker();
        let unknown = JobId::new("20260101000000000-00000000");
        assert!(matches!(
            tracker.resolve(&unknown),
            Err(StoreError::JobNotFound(_))
        ));

        let job = Job::new(request());
        tracker.register(&job).unwrap();
        assert!(matches!(
            tracker.resolve(&job.id),
            Err(StoreError::JobPending(_))
        ));

        let outputs = BTreeMap::from([(TargetId::new("node-1"), "ok".to_owned())]);
        tracker
            .complete(&job.id, JobOutcome::succeeded(outputs.clone()))
            .unwrap();
        let outcome = tracker.resolve(&job.id).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.outputs, outputs);
    }

    #[test]
    fn resolve_is_idempotent() {
        let (_dir, tracker) = tracker();
        let job = Job::new(request());
        tracker.register(&job).unwrap();
        tracker
            .complete(&job.id, JobOutcome::failed("boom", BTreeMap::new()))
            .unwrap();
        let first = tracker.resolve(&job.id).unwrap();
        let second = tracker.resolve(&job.id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.error.as_deref(), Some("boom"));
    }

    #[test]
    fn second_completion_refused() {
        let (_dir, tracker) = tracker();
        let job = Job::new(request());
        tracker.register(&job).unwrap();
        tracker
            .complete(&job.id, JobOutcome::succeeded(BTreeMap::new()))
            .unwrap();
        assert!(matches!(
            tracker.complete(&job.id, JobOutcome::succeeded(BTreeMap::new())),
            Err(StoreError::JobAlreadyCompleted(_))
        ));
    }

    #[test]
    fn malformed_id_is_not_found() {
        let (_dir, tracker) = tracker();
        assert!(matches!(
            tracker.get(&JobId::new("../../etc/passwd")),
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[test]
    fn list_returns_jobs_in_submission_order() {
        let (_dir, tracker) = tracker();
        // Same millisecond, so the id suffix alone would order these backwards.
        let mut first = Job::new(request());
        first.id = JobId::new("20260101000000000-ffffffff");
        first.submitted_at = "2026-01-01T00:00:00.000100+00:00".to_owned();
        let mut second = Job::new(JobRequest::run_command("uptime", TargetSelector::All));
        second.id = JobId::new("20260101000000000-00000000");
        second.submitted_at = "2026-01-01T00:00:00.000200+00:00".to_owned();
        tracker.register(&first).unwrap();
        tracker.register(&second).unwrap();

        let ids: Vec<JobId> = tracker.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
