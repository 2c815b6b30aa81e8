use super::get_result::print_outcome;
use super::{fail, json_pretty, with_spinner, EXIT_SUCCESS};
use stagehand_core::{CoreError, Engine};
use stagehand_schema::{JobRequest, TargetSelector, UnitId};
use std::path::Path;
use std::process::{Command, Stdio};

/// Where a detached `run-job` worker finds the same store and settings.
pub struct WorkerContext<'a> {
    pub store: &'a Path,
    pub settings: &'a Path,
}

pub fn run(
    engine: &Engine,
    units: &[String],
    command: Option<&str>,
    targets: TargetSelector,
    detach: Option<&WorkerContext<'_>>,
    json: bool,
) -> Result<u8, String> {
    let request = match command {
        Some(cmd) => JobRequest::run_command(cmd, targets),
        None => {
            let units = units
                .iter()
                .map(|u| UnitId::parse(u).map_err(|e| fail(&CoreError::from(e))))
                .collect::<Result<Vec<_>, _>>()?;
            JobRequest::apply_units(units, targets)
        }
    };
    let job = engine.submit(request).map_err(|e| fail(&e))?;

    let Some(worker) = detach else {
        let outcome = with_spinner(
            json,
            &format!("running {}...", job.request.action),
            "job finished",
            "job failed",
            || engine.run_job(&job.id),
        )?;
        return print_outcome(&job.id, &outcome, json);
    };

    let exe = std::env::current_exe()
        .map_err(|e| format!("failed to locate the stagehand binary: {e}"))?;
    Command::new(exe)
        .arg("--store")
        .arg(worker.store)
        .arg("--settings")
        .arg(worker.settings)
        .arg("run-job")
        .arg(job.id.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to start job worker: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "job_id": job.id,
            "status": "submitted",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("submitted job {}", job.id);
    }
    Ok(EXIT_SUCCESS)
}
