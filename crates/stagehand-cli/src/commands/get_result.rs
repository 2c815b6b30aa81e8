use super::{colorize_status, fail, json_pretty, print_outputs, EXIT_FAILURE, EXIT_SUCCESS};
use stagehand_core::Engine;
use stagehand_schema::JobId;
use stagehand_store::JobOutcome;

pub fn run(engine: &Engine, id: &str, json: bool) -> Result<u8, String> {
    let id = JobId::new(id);
    let outcome = engine.get_job_result(&id).map_err(|e| fail(&e))?;
    print_outcome(&id, &outcome, json)
}

pub fn print_outcome(id: &JobId, outcome: &JobOutcome, json: bool) -> Result<u8, String> {
    if json {
        let payload = serde_json::json!({
            "job_id": id,
            "result": outcome,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("job {id} {}", colorize_status(outcome.success));
        print_outputs(&outcome.outputs);
        if let Some(error) = &outcome.error {
            eprintln!("{error}");
        }
    }
    Ok(if outcome.success {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
