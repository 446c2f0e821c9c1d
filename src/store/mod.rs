// Module: Report Store
// Holds the current report, the append-only history and the live subscriber
// channel. The scheduler is the only writer; everything else reads.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::protocol::Report;

const REPORT_SUFFIX: &str = ".report.json";
const SUBSCRIBER_CAPACITY: usize = 16;

/// Shared, thread-safe view over persisted reports.
///
/// Published reports are never mutated; readers get `Arc<Report>` handles,
/// so a reader holds either the previous complete report or the new one.
pub struct ReportStore {
    dir: Option<PathBuf>,
    /// Oldest first. The last entry is the current report, so the two can
    /// never disagree.
    reports: RwLock<Vec<Arc<Report>>>,
    sender: broadcast::Sender<Arc<Report>>,
}

impl ReportStore {
    /// Store without persistence, used by one-shot runs and tests.
    pub fn in_memory() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            dir: None,
            reports: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Opens (creating if needed) the reports directory and loads every
    /// readable report in it. The newest one becomes current.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_report_file(path))
            .collect();
        // File names start with the timestamp, so name order is time order.
        files.sort();

        let mut history = Vec::with_capacity(files.len());
        for path in files {
            match read_report(&path) {
                Ok(report) => history.push(Arc::new(report)),
                Err(e) => warn!(path = ?path, error = %e, "skipping unreadable report"),
            }
        }
        info!(dir = ?dir, reports = history.len(), "report history loaded");

        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            reports: RwLock::new(history),
            sender,
        })
    }

    /// Persists the report, appends it to the history (which makes it
    /// current) and notifies subscribers, in that order.
    ///
    /// A persistence failure is returned, but the report is still published
    /// in memory.
    pub fn publish(&self, report: Report) -> Result<Arc<Report>, StoreError> {
        let report = Arc::new(report);
        let persisted = match &self.dir {
            Some(dir) => write_report(dir, &report).map(|_| ()),
            None => Ok(()),
        };

        self.write_reports().push(Arc::clone(&report));

        // No receivers is fine.
        let receivers = self.sender.send(Arc::clone(&report)).unwrap_or(0);
        debug!(report_id = %report.id, receivers, "report published");

        persisted.map(|_| report)
    }

    pub fn current(&self) -> Option<Arc<Report>> {
        self.read_reports().last().cloned()
    }

    /// All known reports, oldest first.
    pub fn history(&self) -> Vec<Arc<Report>> {
        self.read_reports().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Report>> {
        self.read_reports().iter().find(|r| r.id == id).cloned()
    }

    /// Live feed of newly published reports.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Report>> {
        self.sender.subscribe()
    }

    // Reports are immutable once pushed, so a writer that panicked cannot
    // have left the list half-updated.
    fn read_reports(&self) -> RwLockReadGuard<'_, Vec<Arc<Report>>> {
        self.reports.read().unwrap_or_else(|poisoned| {
            warn!("report store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_reports(&self) -> RwLockWriteGuard<'_, Vec<Arc<Report>>> {
        self.reports.write().unwrap_or_else(|poisoned| {
            warn!("report store lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// `<YYYYMMDDTHHMMSS.mmmZ>-<id>.report.json`
pub fn report_file_name(report: &Report) -> String {
    format!(
        "{}-{}{}",
        report.time.format("%Y%m%dT%H%M%S%.3fZ"),
        report.id,
        REPORT_SUFFIX
    )
}

fn is_report_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(REPORT_SUFFIX) && !n.starts_with('.'))
        .unwrap_or(false)
}

fn read_report(path: &Path) -> Result<Report, StoreError> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes to a hidden temp file and renames it into place so readers never
/// see a partial file.
pub fn write_report(dir: &Path, report: &Report) -> Result<PathBuf, StoreError> {
    let content = serde_json::to_string_pretty(report)?;
    let target = dir.join(report_file_name(report));
    let temp = dir.join(format!(".{}.tmp", report.id));

    fs::write(&temp, content).map_err(|source| StoreError::Io {
        path: temp.clone(),
        source,
    })?;
    fs::rename(&temp, &target).map_err(|source| StoreError::Io {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}
