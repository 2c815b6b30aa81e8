mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::apply::WorkerContext;
use commands::{exit_code_for, fail};
use stagehand_core::{install_signal_handler, Engine};
use stagehand_schema::{load_settings_file, TargetSelector};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Transactional configuration changes across a cluster of nodes"
)]
struct Cli {
    /// Path to the stagehand.toml settings file.
    #[arg(
        long,
        env = "STAGEHAND_SETTINGS",
        default_value = "/etc/stagehand/stagehand.toml",
        global = true
    )]
    settings: String,

    /// Path to the Stagehand store directory.
    #[arg(long, default_value = "~/.local/share/stagehand", global = true)]
    store: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show configuration values for the selected targets.
    Get {
        /// Key paths, e.g. `cluster/storage_enclosure/controller/user`.
        #[arg(required = true)]
        keys: Vec<String>,
        /// Target selector: `*`, a target id, or a comma-separated list.
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
    },
    /// Show the full committed configuration.
    Dump {
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
    },
    /// Apply `key=value` assignments through a registered command.
    Set {
        /// Command name from the settings file.
        command: String,
        /// Assignments; values are parsed as JSON, falling back to strings.
        #[arg(required = true)]
        assignments: Vec<String>,
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
        /// Validate and report without changing anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Register an update repository from a directory, ISO, or URL.
    /// Without a source the repository is removed.
    SetUpdateRepo {
        release: String,
        source: Option<String>,
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Update the configured components in order, with package rollback.
    Update {
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Update the storage controller firmware from a local image.
    FwUpdate {
        source: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Install an SSL certificate bundle on every target.
    SetSslCerts {
        source: PathBuf,
        /// Also apply the configured restart unit.
        #[arg(long, default_value_t = false)]
        restart: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Apply units (or run a raw command) on targets as a tracked job.
    Apply {
        #[arg(required_unless_present = "command", conflicts_with = "command")]
        units: Vec<String>,
        /// Run a shell command instead of units.
        #[arg(long)]
        command: Option<String>,
        #[arg(long, default_value = "*")]
        targets: TargetSelector,
        /// Return immediately with the job id; a background worker runs it.
        #[arg(long = "async", default_value_t = false)]
        detach: bool,
    },
    /// Run a registered job (used by `apply --async`).
    #[command(hide = true)]
    RunJob { id: String },
    /// Show the result of a job.
    GetResult { id: String },
    /// List tracked jobs.
    Jobs,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STAGEHAND_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Completions { shell } => return finish(commands::completions::run::<Cli>(*shell)),
        Commands::ManPages { dir } => return finish(commands::man_pages::run::<Cli>(dir)),
        _ => {}
    }

    install_signal_handler();

    let store_path = expand_tilde(&cli.store);
    let settings_path = expand_tilde(&cli.settings);
    let engine = match open_engine(&store_path, &settings_path) {
        Ok(engine) => engine,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(exit_code_for(&msg));
        }
    };
    let json = cli.json;

    let result = match cli.command {
        Commands::Get { keys, targets } => commands::get::run(&engine, &keys, &targets, json),
        Commands::Dump { targets } => commands::dump::run(&engine, &targets, json),
        Commands::Set {
            command,
            assignments,
            targets,
            dry_run,
        } => commands::set::run(&engine, &command, &assignments, targets, dry_run, json),
        Commands::SetUpdateRepo {
            release,
            source,
            targets,
            dry_run,
        } => commands::set_update_repo::run(
            &engine,
            &release,
            source.as_deref(),
            targets,
            dry_run,
            json,
        ),
        Commands::Update { targets, dry_run } => {
            commands::update::run(&engine, &targets, dry_run, json)
        }
        Commands::FwUpdate { source, dry_run } => {
            commands::fw_update::run(&engine, &source, dry_run, json)
        }
        Commands::SetSslCerts {
            source,
            restart,
            dry_run,
        } => commands::set_ssl_certs::run(&engine, &source, restart, dry_run, json),
        Commands::Apply {
            units,
            command,
            targets,
            detach,
        } => {
            let worker = WorkerContext {
                store: &store_path,
                settings: &settings_path,
            };
            commands::apply::run(
                &engine,
                &units,
                command.as_deref(),
                targets,
                detach.then_some(&worker),
                json,
            )
        }
        Commands::RunJob { id } => commands::run_job::run(&engine, &id, json),
        Commands::GetResult { id } => commands::get_result::run(&engine, &id, json),
        Commands::Jobs => commands::jobs::run(&engine, json),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    };

    finish(result)
}

fn open_engine(store_path: &Path, settings_path: &Path) -> Result<Engine, String> {
    let settings = load_settings_file(settings_path).map_err(|e| {
        format!("settings error: {}: {e}", settings_path.display())
    })?;
    Engine::new(store_path, settings).map_err(|e| fail(&e))
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn expand_tilde_uses_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde("~/x"), PathBuf::from(home).join("x"));
        }
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn settings_errors_map_to_validation_exit() {
        let msg = open_engine(Path::new("/nonexistent/store"), Path::new("/nonexistent.toml"))
            .err()
            .unwrap_or_default();
        assert!(msg.starts_with("settings error:"));
        assert_eq!(exit_code_for(&msg), commands::EXIT_VALIDATION_ERROR);
    }
}
