use super::{json_pretty, print_outputs, with_spinner, EXIT_SUCCESS};
use stagehand_core::Engine;
use stagehand_schema::TargetSelector;

pub fn run(
    engine: &Engine,
    targets: &TargetSelector,
    dry_run: bool,
    json: bool,
) -> Result<u8, String> {
    let report = with_spinner(
        json || dry_run,
        "updating components...",
        "components updated",
        "component update failed",
        || engine.run_package_update(targets, dry_run),
    )?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else if report.dry_run {
        println!(
            "dry run: would update {} on {} target(s)",
            report.components.join(", "),
            report.targets.len()
        );
    } else {
        print_outputs(&report.outputs);
        println!("updated {}", report.components.join(", "));
    }
    Ok(EXIT_SUCCESS)
}
