use super::{json_pretty, print_outputs, with_spinner, EXIT_SUCCESS};
use stagehand_core::Engine;
use std::path::Path;

pub fn run(
    engine: &Engine,
    source: &Path,
    restart: bool,
    dry_run: bool,
    json: bool,
) -> Result<u8, String> {
    let report = with_spinner(
        json || dry_run,
        "installing certificates...",
        "certificates installed",
        "certificate installation failed",
        || engine.set_ssl_certs(source, restart, dry_run),
    )?;
    if json {
        println!("{}", json_pretty(&report)?);
    } else if report.dry_run {
        let units: Vec<&str> = report.units.iter().map(|u| u.as_str()).collect();
        println!(
            "dry run: would install {} and apply {} on {} target(s)",
            report.dest.display(),
            units.join(", "),
            report.targets.len()
        );
    } else {
        print_outputs(&report.outputs);
        println!("installed {}", report.dest.display());
    }
    Ok(EXIT_SUCCESS)
}
