use crate::backend::TargetBackend;
use crate::RuntimeError;
use stagehand_schema::{Settings, TargetId, UnitId};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs change-units and commands through `sh`.
///
/// Unit `a.b.c` maps to the script `<units_dir>/a/b/c.sh`. With a
/// `remote_shell` template such as `ssh -o BatchMode=yes {target}`, the
/// script is streamed to the target's `sh -s`; without one every target is
/// the local host.
pub struct ShellBackend {
    units_dir: PathBuf,
    remote_shell: Option<String>,
    checkpoint_cmd: Option<String>,
    rollback_cmd: Option<String>,
}

impl ShellBackend {
    pub fn new(units_dir: impl Into<PathBuf>) -> Self {
        Self {
            units_dir: units_dir.into(),
            remote_shell: None,
            checkpoint_cmd: None,
            rollback_cmd: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let units_dir = settings
            .runtime
            .units_dir
            .clone()
            .unwrap_or_else(|| settings.paths.file_roots.join("units"));
        Self {
            units_dir,
            remote_shell: settings.runtime.remote_shell.clone(),
            checkpoint_cmd: settings.packages.checkpoint_cmd.clone(),
            rollback_cmd: settings.packages.rollback_cmd.clone(),
        }
    }

    pub fn unit_script(&self, unit: &UnitId) -> PathBuf {
        let mut path = self.units_dir.clone();
        let segments: Vec<&str> = unit.split('.').collect();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(dir);
            }
            path.push(format!("{last}.sh"));
        }
        path
    }

    fn remote_prefix(&self, target: &TargetId) -> Option<String> {
        self.remote_shell
            .as_ref()
            .map(|template| template.replace("{target}", target))
    }

    fn run(&self, target: &TargetId, line: &str, stdin: Option<&Path>) -> Result<String, RuntimeError> {
        debug!("shell[{target}]: {line}");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(line)
            .env("STAGEHAND_TARGET", target.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match stdin {
            Some(script) => cmd.stdin(std::fs::File::open(script)?),
            None => cmd.stdin(Stdio::null()),
        };
        let output = cmd
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to spawn sh: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::ExecFailed(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(1),
                stderr.trim()
            )))
        }
    }

    fn run_line(&self, target: &TargetId, command: &str) -> Result<String, RuntimeError> {
        match self.remote_prefix(target) {
            Some(prefix) => self.run(target, &format!("{prefix} {}", shell_quote(command)), None),
            None => self.run(target, command, None),
        }
    }
}

/// Quote `s` as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl TargetBackend for ShellBackend {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn available(&self) -> bool {
        Command::new("sh")
            .args(["-c", "true"])
            .status()
            .is_ok_and(|s| s.success())
    }

    fn apply_unit(&self, target: &TargetId, unit: &UnitId) -> Result<String, RuntimeError> {
        let script = self.unit_script(unit);
        if !script.is_file() {
            return Err(RuntimeError::ExecFailed(format!(
                "unit {unit} has no script at {}",
                script.display()
            )));
        }
        let env = format!(
            "STAGEHAND_TARGET={} STAGEHAND_UNIT={}",
            shell_quote(target),
            shell_quote(unit)
        );
        match self.remote_prefix(target) {
            Some(prefix) => self.run(target, &format!("{prefix} env {env} sh -s"), Some(&script)),
            None => self.run(
                target,
                &format!("env {env} sh {}", shell_quote(&script.to_string_lossy())),
                None,
            ),
        }
    }

    fn run_command(&self, target: &TargetId, command: &str) -> Result<String, RuntimeError> {
        self.run_line(target, command)
    }

    fn package_checkpoint(&self, target: &TargetId) -> Result<String, RuntimeError> {
        let cmd = self
            .checkpoint_cmd
            .as_deref()
            .ok_or(RuntimeError::Unsupported(
                "package checkpoints (packages.checkpoint_cmd is unset)",
                "shell".to_owned(),
            ))?;
        let checkpoint = self.run_line(target, cmd)?;
        if checkpoint.is_empty() {
            return Err(RuntimeError::ExecFailed(format!(
                "checkpoint command printed nothing on {target}"
            )));
        }
        Ok(checkpoint)
    }

    fn package_rollback(&self, target: &TargetId, checkpoint: &str) -> Result<(), RuntimeError> {
        let template = self
            .rollback_cmd
            .as_deref()
            .ok_or(RuntimeError::Unsupported(
                "package rollback (packages.rollback_cmd is unset)",
                "shell".to_owned(),
            ))?;
        self.run_line(target, &template.replace("{checkpoint}", &shell_quote(checkpoint)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn node() -> TargetId {
        TargetId::new("node-1")
    }

    #[test]
    fn unit_script_maps_dots_to_dirs() {
        let backend = ShellBackend::new("/srv/units");
        assert_eq!(
            backend.unit_script(&UnitId::new("components.system.network")),
            PathBuf::from("/srv/units/components/system/network.sh")
        );
    }

    #[test]
    fn quote_handles_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn apply_runs_script_with_environment() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("components")).unwrap();
        fs::write(
            dir.path().join("components").join("hello.sh"),
            "echo \"$STAGEHAND_UNIT on $STAGEHAND_TARGET\"\n",
        )
        .unwrap();
        let backend = ShellBackend::new(dir.path());
        let out = backend
            .apply_unit(&node(), &UnitId::new("components.hello"))
            .unwrap();
        assert_eq!(out, "components.hello on node-1");
    }

    #[test]
    fn missing_script_and_failing_script_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.sh"), "echo nope >&2\nexit 3\n").unwrap();
        let backend = ShellBackend::new(dir.path());
        assert!(backend.apply_unit(&node(), &UnitId::new("absent")).is_err());
        let err = backend
            .apply_unit(&node(), &UnitId::new("broken"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("nope"));
    }

    #[test]
    fn run_command_returns_stdout() {
        let backend = ShellBackend::new("/nonexistent");
        assert_eq!(backend.run_command(&node(), "echo hi").unwrap(), "hi");
        assert!(backend.run_command(&node(), "false").is_err());
    }

    #[test]
    fn remote_template_wraps_command() {
        let mut backend = ShellBackend::new("/nonexistent");
        // `sh -c` stands in for a remote shell that receives one quoted word.
        backend.remote_shell = Some("sh -c".to_owned());
        assert_eq!(backend.run_command(&node(), "echo 'a b'").unwrap(), "a b");
    }

    #[test]
    fn checkpoints_need_configuration() {
        let mut backend = ShellBackend::new("/nonexistent");
        assert!(matches!(
            backend.package_checkpoint(&node()),
            Err(RuntimeError::Unsupported(..))
        ));
        backend.checkpoint_cmd = Some("echo 42".to_owned());
        backend.rollback_cmd = Some("test {checkpoint} = 42".to_owned());
        let ckpt = backend.package_checkpoint(&node()).unwrap();
        assert_eq!(ckpt, "42");
        backend.package_rollback(&node(), &ckpt).unwrap();
        assert!(backend.package_rollback(&node(), "41").is_err());
    }
}
