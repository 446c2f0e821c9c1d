//! # Daemon
//!
//! Runs the pipeline on a fixed cadence as a single instance.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! - [`Daemon::run`] claims the markers (refusing if another instance is
//!   up), runs the [`Scheduler`] until a shutdown signal, waits for the
//!   in-flight run and marks the daemon down again.
//! - [`status`] and [`stop`] read and act on the markers from another
//!   process.
//! - [`spawn_background`] re-executes the current binary detached, with its
//!   output in `daemon.log`, and [`wait_until_up`] confirms it claimed the
//!   markers.

pub mod markers;
pub mod scheduler;

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::errors::LifecycleError;
use crate::pipeline::Pipeline;
use crate::store::ReportStore;

pub use markers::{DaemonStatus, Markers};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats};

/// Flag stripped from the arguments when re-executing in the background.
pub const BACKGROUND_FLAG: &str = "--background";

/// Output of a background daemon, inside the daemon directory.
pub const LOG_FILE: &str = "daemon.log";

const STARTUP_POLL: Duration = Duration::from_millis(100);

pub struct Daemon {
    markers: Markers,
    scheduler: Scheduler,
}

impl Daemon {
    pub fn new(config: &DaemonConfig, pipeline: Pipeline, store: Arc<ReportStore>) -> Self {
        Self {
            markers: Markers::new(&config.directory),
            scheduler: Scheduler::new(pipeline, store, config.interval(), config.run_on_start),
        }
    }

    pub fn state(&self) -> tokio::sync::watch::Receiver<SchedulerState> {
        self.scheduler.state()
    }

    /// Runs until `shutdown` resolves.
    ///
    /// Fails with [`LifecycleError::AlreadyRunning`] before any pipeline run
    /// when the markers say another instance is up and `force` is not set.
    pub async fn run<F>(&self, force: bool, shutdown: F) -> Result<SchedulerStats, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        self.markers.acquire(force)?;
        info!(pid = std::process::id(), dir = ?self.markers.dir(), "daemon started");

        let stats = self.scheduler.run(shutdown).await;

        self.markers.release()?;
        info!("daemon stopped");
        Ok(stats)
    }
}

pub fn status(directory: &Path) -> Result<DaemonStatus, LifecycleError> {
    Markers::new(directory).read_status()
}

/// Sends SIGTERM to the recorded daemon pid. Returns that pid.
pub fn stop(directory: &Path) -> Result<u32, LifecycleError> {
    let current = status(directory)?;
    let pid = match current {
        DaemonStatus { up: true, pid: Some(pid) } => pid,
        _ => return Err(LifecycleError::NotRunning),
    };

    let output = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .output()
        .map_err(|e| LifecycleError::Signal {
            pid,
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(LifecycleError::Signal {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!(pid, "stop signal sent");
    Ok(pid)
}

pub fn log_path(directory: &Path) -> PathBuf {
    directory.join(LOG_FILE)
}

/// Re-executes the current binary with `args` minus [`BACKGROUND_FLAG`],
/// detached from the terminal. Stdout and stderr are appended to
/// [`LOG_FILE`] in `directory`.
pub fn spawn_background<I>(args: I, directory: &Path) -> Result<Child, LifecycleError>
where
    I: IntoIterator<Item = OsString>,
{
    Markers::new(directory).init()?;
    let log_path = log_path(directory);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|source| LifecycleError::Marker {
            path: log_path.clone(),
            source,
        })?;
    let log_err = log.try_clone().map_err(|source| LifecycleError::Marker {
        path: log_path.clone(),
        source,
    })?;

    let exe = std::env::current_exe().map_err(LifecycleError::Spawn)?;
    let args = background_args(args);

    let mut command = Command::new(exe);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    // Own process group: terminal signals aimed at the parent do not reach it.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn().map_err(LifecycleError::Spawn)?;
    info!(pid = child.id(), log = ?log_path, "background daemon spawned");
    Ok(child)
}

/// Waits until the markers name `child` as the running daemon.
///
/// Fails if the child exits first. Returns the pid once it is up, or when
/// `limit` passes with the child still alive but not yet up.
pub async fn wait_until_up(
    directory: &Path,
    child: &mut Child,
    limit: Duration,
) -> Result<u32, LifecycleError> {
    let pid = child.id();
    let markers = Markers::new(directory);
    let deadline = tokio::time::Instant::now() + limit;

    loop {
        if let Some(exit) = child.try_wait().map_err(LifecycleError::Spawn)? {
            return Err(LifecycleError::BackgroundExited {
                code: exit.code(),
                log: log_path(directory),
            });
        }

        let current = markers.read_status()?;
        if current.up && current.pid == Some(pid) {
            return Ok(pid);
        }

        if tokio::time::Instant::now() >= deadline {
            warn!(pid, "background daemon not up yet, still starting");
            return Ok(pid);
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
}

/// Drops the program name and every background flag.
fn background_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .skip(1)
        .filter(|a| a != BACKGROUND_FLAG)
        .collect()
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineLimits;
    use crate::errors::FetchError;
    use crate::fetcher::ResponseFetcher;
    use crate::protocol::{CapturedResponse, EndpointDefinition};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResponseFetcher for CountingFetcher {
        async fn fetch(
            &self,
            definition: &EndpointDefinition,
        ) -> Result<CapturedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CapturedResponse {
                url: definition.request.url.clone(),
                status: 200,
                headers: Default::default(),
                body: json!({ "ok": true }),
                elapsed_ms: 1,
            })
        }
    }

    fn daemon(dir: &Path, fetcher: Arc<CountingFetcher>) -> (Daemon, Arc<ReportStore>) {
        let def: EndpointDefinition = serde_json::from_value(json!({
            "name": "health",
            "request": { "url": "http://localhost/health" },
            "test_cases": [ { "field": "$.ok", "operator": "eq", "expected": true } ]
        }))
        .unwrap();
        let config = DaemonConfig {
            directory: dir.to_path_buf(),
            interval_secs: 60,
            run_on_start: true,
        };
        let store = Arc::new(ReportStore::in_memory());
        let pipeline = Pipeline::new(vec![def], vec![], fetcher, PipelineLimits::default());
        (Daemon::new(&config, pipeline, Arc::clone(&store)), store)
    }

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("apisense-daemon-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_refuses_when_already_up() {
        let dir = temp_dir();
        Markers::new(&dir).init().unwrap();
        std::fs::write(dir.join(markers::STATUS_FILE), "up").unwrap();
        std::fs::write(dir.join(markers::PID_FILE), "4242").unwrap();

        let fetcher = Arc::new(CountingFetcher::default());
        let (daemon, store) = daemon(&dir, Arc::clone(&fetcher));

        let err = daemon
            .run(false, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::AlreadyRunning { pid: Some(4242) }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(store.current().is_none());
        // The other instance's markers are untouched.
        assert_eq!(status(&dir).unwrap(), DaemonStatus { up: true, pid: Some(4242) });
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_force_recovers_and_marks_down_on_exit() {
        let dir = temp_dir();
        Markers::new(&dir).init().unwrap();
        std::fs::write(dir.join(markers::STATUS_FILE), "up").unwrap();

        let fetcher = Arc::new(CountingFetcher::default());
        let (daemon, store) = daemon(&dir, Arc::clone(&fetcher));
        let state = daemon.state();

        let stats = daemon
            .run(true, tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(stats.runs, 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(store.current().unwrap().status.is_passed());
        assert_eq!(status(&dir).unwrap(), DaemonStatus { up: false, pid: None });
        assert!(!dir.join(markers::LOCK_FILE).exists());
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_stop_when_down_is_not_running() {
        let dir = temp_dir();
        Markers::new(&dir).init().unwrap();
        assert!(matches!(stop(&dir), Err(LifecycleError::NotRunning)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_reports_child_that_exits_early() {
        let dir = temp_dir();
        Markers::new(&dir).init().unwrap();
        let mut child = Command::new("/bin/sh").args(["-c", "exit 3"]).spawn().unwrap();

        let err = wait_until_up(&dir, &mut child, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            LifecycleError::BackgroundExited { code, log } => {
                assert_eq!(code, Some(3));
                assert_eq!(log, dir.join(LOG_FILE));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_returns_once_child_is_up() {
        let dir = temp_dir();
        Markers::new(&dir).init().unwrap();
        let mut child = Command::new("/bin/sh").args(["-c", "sleep 5"]).spawn().unwrap();
        std::fs::write(dir.join(markers::PID_FILE), child.id().to_string()).unwrap();
        std::fs::write(dir.join(markers::STATUS_FILE), "up").unwrap();

        let pid = wait_until_up(&dir, &mut child, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(pid, child.id());
        let _ = child.kill();
        let _ = child.wait();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_background_args_drop_flag_and_program() {
        let args = ["apisense", "daemon", "start", "--background", "--force"]
            .iter()
            .map(OsString::from);
        assert_eq!(
            background_args(args),
            vec![
                OsString::from("daemon"),
                OsString::from("start"),
                OsString::from("--force")
            ]
        );
    }
}
