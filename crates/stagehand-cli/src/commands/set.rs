use super::{json_pretty, print_outputs, with_spinner, EXIT_SUCCESS};
use stagehand_core::{ChangeReport, Engine};
use stagehand_schema::TargetSelector;

pub fn run(
    engine: &Engine,
    command: &str,
    assignments: &[String],
    targets: TargetSelector,
    dry_run: bool,
    json: bool,
) -> Result<u8, String> {
    let report = with_spinner(
        json || dry_run,
        &format!("applying '{command}'..."),
        "change applied",
        "change failed",
        || engine.set(command, assignments, targets, dry_run),
    )?;
    print_report(&report, json)
}

pub fn print_report(report: &ChangeReport, json: bool) -> Result<u8, String> {
    if json {
        println!("{}", json_pretty(report)?);
    } else if report.dry_run {
        let targets: Vec<&str> = report.targets.iter().map(|t| t.as_str()).collect();
        println!(
            "dry run: would change {} on {} (current version {})",
            report.keys.join(", "),
            targets.join(", "),
            report.version
        );
    } else {
        print_outputs(&report.outputs);
        println!(
            "committed version {} ({})",
            report.version,
            report.snapshot_id.as_deref().unwrap_or("-")
        );
    }
    Ok(EXIT_SUCCESS)
}
