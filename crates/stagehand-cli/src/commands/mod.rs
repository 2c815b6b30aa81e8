pub mod apply;
pub mod completions;
pub mod dump;
pub mod fw_update;
pub mod get;
pub mod get_result;
pub mod jobs;
pub mod man_pages;
pub mod run_job;
pub mod set;
pub mod set_ssl_certs;
pub mod set_update_repo;
pub mod update;

use indicatif::{ProgressBar, ProgressStyle};
use stagehand_core::{CoreError, ErrorKind};
use stagehand_schema::TargetId;
use std::collections::BTreeMap;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_VALIDATION_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
pub const EXIT_PENDING: u8 = 4;
pub const EXIT_RESTORE_FAILED: u8 = 5;

/// Render an engine error with its category prefix, which `main` turns into
/// an exit code.
pub fn fail(e: &CoreError) -> String {
    format!("{} error: {e}", e.kind().label())
}

pub fn exit_code_for(msg: &str) -> u8 {
    let prefixed = |kind: ErrorKind| msg.starts_with(&format!("{} error:", kind.label()));
    if prefixed(ErrorKind::Validation) || msg.starts_with("settings error:") {
        EXIT_VALIDATION_ERROR
    } else if prefixed(ErrorKind::State) || msg.starts_with("store lock:") {
        EXIT_STATE_ERROR
    } else if prefixed(ErrorKind::Pending) {
        EXIT_PENDING
    } else if prefixed(ErrorKind::Restore) {
        EXIT_RESTORE_FAILED
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Run `op` behind a spinner unless JSON output was requested.
pub fn with_spinner<T>(
    json: bool,
    msg: &str,
    done: &str,
    failed: &str,
    op: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, String> {
    let pb = (!json).then(|| spinner(msg));
    let result = op();
    if let Some(pb) = &pb {
        match &result {
            Ok(_) => spin_ok(pb, done),
            Err(_) => spin_fail(pb, failed),
        }
    }
    result.map_err(|e| fail(&e))
}

pub fn colorize_status(success: bool) -> String {
    use console::Style;
    if success {
        Style::new().green().apply_to("succeeded").to_string()
    } else {
        Style::new().red().bold().apply_to("failed").to_string()
    }
}

pub fn print_outputs(outputs: &BTreeMap<TargetId, String>) {
    for (target, output) in outputs {
        let header = console::Style::new().bold().apply_to(target.as_str());
        println!("{header}:");
        for line in output.lines() {
            println!("  {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_schema::ValidationError;
    use stagehand_store::StoreError;

    #[test]
    fn exit_codes_follow_error_kind() {
        let validation = fail(&CoreError::from(ValidationError::EmptyChange));
        assert!(validation.starts_with("validation error:"));
        assert_eq!(exit_code_for(&validation), EXIT_VALIDATION_ERROR);

        let state = fail(&CoreError::from(StoreError::NotStaged));
        assert_eq!(exit_code_for(&state), EXIT_STATE_ERROR);

        let pending = fail(&CoreError::JobPending("j".to_owned()));
        assert_eq!(exit_code_for(&pending), EXIT_PENDING);

        assert_eq!(exit_code_for("settings error: bad"), EXIT_VALIDATION_ERROR);
        assert_eq!(exit_code_for("something else"), EXIT_FAILURE);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_VALIDATION_ERROR,
            EXIT_STATE_ERROR,
            EXIT_PENDING,
            EXIT_RESTORE_FAILED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn json_pretty_serializes_map() {
        let val = serde_json::json!({"key": "value"});
        assert!(json_pretty(&val).unwrap().contains("\"value\""));
    }

    #[test]
    fn colorize_status_mentions_outcome() {
        assert!(colorize_status(true).contains("succeeded"));
        assert!(colorize_status(false).contains("failed"));
    }

    #[test]
    fn spinner_lifecycle() {
        let pb = spinner("working...");
        spin_ok(&pb, "done");
        let pb = spinner("working...");
        spin_fail(&pb, "failed");
    }
}
