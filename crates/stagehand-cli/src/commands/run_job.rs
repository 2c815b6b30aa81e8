use super::get_result::print_outcome;
use super::{fail, EXIT_FAILURE, EXIT_SUCCESS};
use stagehand_core::Engine;
use stagehand_schema::JobId;

/// Worker side of `apply --async`: runs one registered job and records its
/// outcome. Prints only with `--json`.
pub fn run(engine: &Engine, id: &str, json: bool) -> Result<u8, String> {
    let id = JobId::new(id);
    let outcome = engine.run_job(&id).map_err(|e| fail(&e))?;
    if json {
        return print_outcome(&id, &outcome, true);
    }
    Ok(if outcome.success {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
