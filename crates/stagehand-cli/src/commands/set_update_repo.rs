use super::set::print_report;
use super::with_spinner;
use stagehand_core::Engine;
use stagehand_schema::TargetSelector;

pub fn run(
    engine: &Engine,
    release: &str,
    source: Option<&str>,
    targets: TargetSelector,
    dry_run: bool,
    json: bool,
) -> Result<u8, String> {
    let msg = match source {
        Some(src) => format!("registering repository {release} from {src}..."),
        None => format!("removing repository {release}..."),
    };
    let report = with_spinner(
        json || dry_run,
        &msg,
        "repository updated",
        "repository update failed",
        || engine.set_update_repo(release, source, targets, dry_run),
    )?;
    print_report(&report, json)
}
