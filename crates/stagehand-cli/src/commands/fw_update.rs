use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use stagehand_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, source: &Path, dry_run: bool, json: bool) -> Result<u8, String> {
    let output = with_spinner(
        json || dry_run,
        "updating controller firmware...",
        "firmware updated",
        "firmware update failed",
        || engine.fw_update(source, dry_run),
    )?;
    if json {
        let payload = serde_json::json!({
            "source": source,
            "dry_run": dry_run,
            "output": output,
        });
        println!("{}", json_pretty(&payload)?);
    } else if !output.is_empty() {
        println!("{output}");
    }
    Ok(EXIT_SUCCESS)
}
