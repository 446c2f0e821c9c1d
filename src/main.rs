mod comparer;
mod config;
mod daemon;
mod errors;
mod fetcher;
mod loader;
mod pipeline;
mod protocol;
mod selector;
mod store;
mod telemetry;
mod template;
mod validation;
mod validators;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use errors::{ConfigError, ErrorCategory, ErrorCode, LifecycleError, StoreError};
use fetcher::HttpFetcher;
use pipeline::Pipeline;
use protocol::Report;
use store::ReportStore;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

const EXIT_OK: i32 = 0;
const EXIT_REPORT_FAILED: i32 = 1;

const BACKGROUND_STARTUP_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "apisense")]
#[command(about = "Continuously validates API endpoints against declarative expectations", long_about = None)]
struct Cli {
    /// Configuration file (default: $APISENSE_CONFIG or ~/apisense/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More output; repeat for trace level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the validation daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Runs every endpoint once and prints the report
    Validate {
        /// Write the report to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Loads and checks the configuration and definitions without running them
    Check,

    /// Browse persisted reports
    Reports {
        #[command(subcommand)]
        command: ReportCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Starts the daemon in the foreground
    Start {
        /// Detach and run in the background
        #[arg(long)]
        background: bool,

        /// Clear stale state left by an unclean shutdown
        #[arg(short, long)]
        force: bool,
    },

    /// Signals the running daemon to stop
    Stop,

    /// Shows whether the daemon is running
    Status,
}

#[derive(Subcommand)]
enum ReportCommands {
    /// Lists persisted reports, oldest first
    List,

    /// Prints the newest report as JSON
    Latest,

    /// Prints one report as JSON
    Show {
        /// Report id
        id: Uuid,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig::from_env().with_verbosity(cli.verbose);
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("warning: cannot initialize telemetry: {:#}", e);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => match error_code(&e) {
            Some(code) => {
                error!(code = %code, error = %format!("{:#}", e), "command failed");
                eprintln!("error[{}]: {:#}", code, e);
                code.category().exit_code()
            }
            None => {
                error!(error = %format!("{:#}", e), "command failed");
                eprintln!("error: {:#}", e);
                ErrorCategory::Internal.exit_code()
            }
        },
    };

    shutdown_telemetry();
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Start { background, force } => {
                start_daemon(&config_path, background, force).await
            }
            DaemonCommands::Stop => {
                let config = loader::load_config(&config_path)?;
                let pid = daemon::stop(&config.daemon.directory)?;
                println!("sent stop signal to daemon (pid {})", pid);
                Ok(EXIT_OK)
            }
            DaemonCommands::Status => {
                let config = loader::load_config(&config_path)?;
                let status = daemon::status(&config.daemon.directory)?;
                println!("{}", status);
                Ok(EXIT_OK)
            }
        },
        Commands::Validate { output } => validate_once(&config_path, output.as_deref()).await,
        Commands::Check => check(&config_path),
        Commands::Reports { command } => {
            let config = loader::load_config(&config_path)?;
            let store = ReportStore::open(&config.validation.reports_dir)?;
            match command {
                ReportCommands::List => {
                    for report in store.history() {
                        println!(
                            "{}  {}  {:<6}  {} endpoint(s)",
                            report.id,
                            report.time.to_rfc3339(),
                            status_label(&report),
                            report.endpoints.len()
                        );
                    }
                    Ok(EXIT_OK)
                }
                ReportCommands::Latest => {
                    let report = store.current().ok_or_else(|| anyhow!("no reports yet"))?;
                    println!("{}", serde_json::to_string_pretty(&*report)?);
                    Ok(EXIT_OK)
                }
                ReportCommands::Show { id } => {
                    let report = store
                        .get(id)
                        .ok_or_else(|| anyhow!("no report with id {}", id))?;
                    println!("{}", serde_json::to_string_pretty(&*report)?);
                    Ok(EXIT_OK)
                }
            }
        }
    }
}

async fn start_daemon(config_path: &Path, background: bool, force: bool) -> anyhow::Result<i32> {
    let loaded = loader::load_all(config_path)?;

    let directory = &loaded.config.daemon.directory;

    if background {
        let current = daemon::status(directory)?;
        if current.up && !force {
            return Err(LifecycleError::AlreadyRunning { pid: current.pid }.into());
        }
        let mut child = daemon::spawn_background(std::env::args_os(), directory)?;
        let pid = daemon::wait_until_up(directory, &mut child, BACKGROUND_STARTUP_WAIT).await?;
        println!(
            "daemon started in background (pid {}), logging to {:?}",
            pid,
            daemon::log_path(directory)
        );
        return Ok(EXIT_OK);
    }

    let limits = loaded.config.validation.limits();
    let fetcher = HttpFetcher::new(limits.request_timeout).context("cannot create HTTP client")?;
    let store = Arc::new(ReportStore::open(&loaded.config.validation.reports_dir)?);
    let pipeline = Pipeline::new(loaded.definitions, loaded.validators, Arc::new(fetcher), limits);

    let service = daemon::Daemon::new(&loaded.config.daemon, pipeline, Arc::clone(&store));
    spawn_monitors(&service, &store);
    let stats = service.run(force, daemon::shutdown_signal()).await?;

    info!(runs = stats.runs, skipped_ticks = stats.skipped_ticks, "daemon exited");
    Ok(EXIT_OK)
}

async fn validate_once(config_path: &Path, output: Option<&Path>) -> anyhow::Result<i32> {
    let loaded = loader::load_all(config_path)?;
    let limits = loaded.config.validation.limits();
    let fetcher = HttpFetcher::new(limits.request_timeout).context("cannot create HTTP client")?;
    let pipeline = Pipeline::new(loaded.definitions, loaded.validators, Arc::new(fetcher), limits);

    let store = ReportStore::in_memory();
    let report = store.publish(pipeline.run().await)?;
    let json = serde_json::to_string_pretty(&*report)?;

    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("cannot write report to {:?}", path))?;
            println!("report {} ({}) saved to {:?}", report.id, status_label(&report), path);
        }
        None => println!("{}", json),
    }

    Ok(if report.status.is_passed() {
        EXIT_OK
    } else {
        EXIT_REPORT_FAILED
    })
}

fn check(config_path: &Path) -> anyhow::Result<i32> {
    match loader::load_all(config_path) {
        Ok(loaded) => {
            println!(
                "configuration OK: {} endpoint(s), {} external validator(s)",
                loaded.definitions.len(),
                loaded.validators.len()
            );
            Ok(EXIT_OK)
        }
        Err(ConfigError::InvalidDefinitions(problems)) => {
            let code = ErrorCode::DEFINITION_INVALID;
            eprintln!("error[{}]: {} invalid definition(s)", code, problems.len());
            for problem in &problems {
                eprintln!("  - {}", problem);
            }
            Ok(code.category().exit_code())
        }
        Err(e) => Err(e.into()),
    }
}

/// Logs scheduler state changes and every published report.
fn spawn_monitors(service: &daemon::Daemon, store: &ReportStore) {
    let mut state = service.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = ?current, "daemon state changed");
        }
    });

    let mut published = store.subscribe();
    tokio::spawn(async move {
        loop {
            match published.recv().await {
                Ok(report) => info!(
                    report_id = %report.id,
                    status = status_label(&report),
                    endpoints = report.endpoints.len(),
                    "report published"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "report feed lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn status_label(report: &Report) -> &'static str {
    if report.status.is_passed() {
        "passed"
    } else {
        "failed"
    }
}

/// Finds the typed error behind an `anyhow::Error`.
fn error_code(error: &anyhow::Error) -> Option<ErrorCode> {
    if let Some(e) = error.downcast_ref::<ConfigError>() {
        Some(e.code())
    } else if let Some(e) = error.downcast_ref::<LifecycleError>() {
        Some(e.code())
    } else {
        error.downcast_ref::<StoreError>().map(|e| e.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("apisense-cli-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_config(dir: &Path, definition: serde_json::Value) -> PathBuf {
        let defs = dir.join("definitions");
        fs::create_dir_all(&defs).unwrap();
        fs::write(defs.join("users.json"), definition.to_string()).unwrap();
        let config = dir.join("config.json");
        let body = json!({ "validation": { "definitions_dir": defs } });
        fs::write(&config, body.to_string()).unwrap();
        config
    }

    #[test]
    fn test_check_reports_problems_as_exit_code() {
        let dir = temp_dir();
        let config = write_config(
            &dir,
            json!({
                "name": "users",
                "request": { "url": "http://localhost/users" },
                "test_cases": [ { "validator": "missing" } ]
            }),
        );

        // Problems are printed once here, not raised again to `main`.
        assert_eq!(check(&config).unwrap(), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_check_accepts_valid_configuration() {
        let dir = temp_dir();
        let config = write_config(
            &dir,
            json!({
                "name": "users",
                "request": { "url": "http://localhost/users" },
                "test_cases": [ { "field": "status", "operator": "eq", "expected": 200 } ]
            }),
        );

        assert_eq!(check(&config).unwrap(), EXIT_OK);
        let _ = fs::remove_dir_all(&dir);
    }
}
