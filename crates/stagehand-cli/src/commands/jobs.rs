use super::{colorize_status, fail, json_pretty, EXIT_SUCCESS};
use stagehand_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let jobs = engine.list_jobs().map_err(|e| fail(&e))?;
    if json {
        println!("{}", json_pretty(&jobs)?);
    } else if jobs.is_empty() {
        println!("no jobs found");
    } else {
        println!("{:<28} {:<10} {:<10} ACTION", "JOB_ID", "STATUS", "TARGETS");
        for job in &jobs {
            let status = match &job.result {
                Some(outcome) => colorize_status(outcome.success),
                None => console::Style::new().yellow().apply_to("pending").to_string(),
            };
            println!(
                "{:<28} {:<10} {:<10} {}",
                job.id, status, job.request.targets, job.request.action
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
