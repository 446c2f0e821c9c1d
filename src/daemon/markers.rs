//! On-disk lifecycle markers shared with process-management tooling.
//!
//! | File          | Content                                 |
//! |---------------|-----------------------------------------|
//! | `status`      | `up` or `down`                          |
//! | `pid`         | pid of the running daemon, `0` if none  |
//! | `daemon.lock` | pid of the lock holder                  |
//!
//! The lock file is created with create-new semantics, so two concurrent
//! starts cannot both succeed even if both read `down`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::LifecycleError;

pub const STATUS_FILE: &str = "status";
pub const PID_FILE: &str = "pid";
pub const LOCK_FILE: &str = "daemon.lock";

const STATUS_UP: &str = "up";
const STATUS_DOWN: &str = "down";

/// What the markers say about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    pub up: bool,
    pub pid: Option<u32>,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.up, self.pid) {
            (true, Some(pid)) => write!(f, "{} (pid {})", STATUS_UP, pid),
            (true, None) => write!(f, "{}", STATUS_UP),
            (false, _) => write!(f, "{}", STATUS_DOWN),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Markers {
    dir: PathBuf,
}

impl Markers {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Creates the directory and writes `down` / `0` where no marker exists yet.
    pub fn init(&self) -> Result<(), LifecycleError> {
        fs::create_dir_all(&self.dir).map_err(|source| LifecycleError::Marker {
            path: self.dir.clone(),
            source,
        })?;
        if !self.path(STATUS_FILE).exists() {
            self.write(STATUS_FILE, STATUS_DOWN)?;
        }
        if !self.path(PID_FILE).exists() {
            self.write(PID_FILE, "0")?;
        }
        Ok(())
    }

    /// Missing or unreadable markers read as down.
    pub fn read_status(&self) -> Result<DaemonStatus, LifecycleError> {
        let status = self.read(STATUS_FILE)?;
        let pid = self
            .read(PID_FILE)?
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|p| *p != 0);

        Ok(DaemonStatus {
            up: status.as_deref() == Some(STATUS_UP),
            pid,
        })
    }

    /// Claims the single-instance slot for the current process.
    ///
    /// Refuses when the status reads `up` unless `force` is set, in which
    /// case the stale status and lock are cleared first.
    pub fn acquire(&self, force: bool) -> Result<(), LifecycleError> {
        self.init()?;
        let current = self.read_status()?;

        if current.up {
            if !force {
                return Err(LifecycleError::AlreadyRunning { pid: current.pid });
            }
            warn!(stale_pid = ?current.pid, "forcing start, clearing stale daemon state");
            self.clear()?;
        } else if force {
            self.remove_lock()?;
        }

        let pid = std::process::id();
        let lock_path = self.path(LOCK_FILE);
        let mut lock = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .read(LOCK_FILE)?
                    .and_then(|p| p.parse::<u32>().ok());
                return Err(LifecycleError::AlreadyRunning { pid: holder });
            }
            Err(source) => {
                return Err(LifecycleError::Marker {
                    path: lock_path,
                    source,
                })
            }
        };
        let claimed = (|| {
            lock.write_all(pid.to_string().as_bytes())
                .map_err(|source| LifecycleError::Marker {
                    path: lock_path.clone(),
                    source,
                })?;
            self.write(PID_FILE, &pid.to_string())?;
            self.write(STATUS_FILE, STATUS_UP)
        })();

        if let Err(e) = claimed {
            drop(lock);
            self.rollback();
            return Err(e);
        }

        info!(pid, dir = ?self.dir, "daemon markers acquired");
        Ok(())
    }

    /// Undoes a partial claim so the next start is not refused.
    fn rollback(&self) {
        if let Err(e) = self.write(PID_FILE, "0") {
            warn!(error = %e, "cannot reset pid marker");
        }
        if let Err(e) = self.remove_lock() {
            warn!(error = %e, "cannot remove daemon lock");
        }
    }

    /// Marks the daemon down and drops the lock.
    pub fn release(&self) -> Result<(), LifecycleError> {
        self.clear()?;
        info!(dir = ?self.dir, "daemon markers released");
        Ok(())
    }

    fn clear(&self) -> Result<(), LifecycleError> {
        self.write(STATUS_FILE, STATUS_DOWN)?;
        self.write(PID_FILE, "0")?;
        self.remove_lock()
    }

    fn remove_lock(&self) -> Result<(), LifecycleError> {
        let path = self.path(LOCK_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LifecycleError::Marker { path, source }),
        }
    }

    fn read(&self, name: &str) -> Result<Option<String>, LifecycleError> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LifecycleError::Marker { path, source }),
        }
    }

    /// Temp file + rename, so readers never see a half-written marker.
    fn write(&self, name: &str, content: &str) -> Result<(), LifecycleError> {
        let path = self.path(name);
        let temp = self.path(&format!(".{}.tmp", name));
        fs::write(&temp, content).map_err(|source| LifecycleError::Marker {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &path).map_err(|source| LifecycleError::Marker {
            path: path.clone(),
            source,
        })?;
        debug!(marker = name, content, "marker written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn markers() -> Markers {
        Markers::new(std::env::temp_dir().join(format!("apisense-markers-{}", Uuid::new_v4())))
    }

    #[test]
    fn test_init_writes_down() {
        let m = markers();
        m.init().unwrap();
        assert_eq!(fs::read_to_string(m.dir().join(STATUS_FILE)).unwrap(), "down");
        assert_eq!(fs::read_to_string(m.dir().join(PID_FILE)).unwrap(), "0");
        assert_eq!(m.read_status().unwrap(), DaemonStatus { up: false, pid: None });
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_acquire_and_release() {
        let m = markers();
        m.acquire(false).unwrap();

        let status = m.read_status().unwrap();
        assert!(status.up);
        assert_eq!(status.pid, Some(std::process::id()));
        assert!(m.dir().join(LOCK_FILE).exists());

        m.release().unwrap();
        assert!(!m.read_status().unwrap().up);
        assert!(!m.dir().join(LOCK_FILE).exists());
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let m = markers();
        m.acquire(false).unwrap();

        let err = m.acquire(false).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning { pid: Some(_) }));
        // Refusal leaves the running instance's markers intact.
        assert!(m.read_status().unwrap().up);
        assert!(m.dir().join(LOCK_FILE).exists());
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_force_clears_stale_state() {
        let m = markers();
        m.init().unwrap();
        fs::write(m.dir().join(STATUS_FILE), "up").unwrap();
        fs::write(m.dir().join(PID_FILE), "4242").unwrap();
        fs::write(m.dir().join(LOCK_FILE), "4242").unwrap();

        assert!(matches!(
            m.acquire(false),
            Err(LifecycleError::AlreadyRunning { pid: Some(4242) })
        ));

        m.acquire(true).unwrap();
        assert_eq!(m.read_status().unwrap().pid, Some(std::process::id()));
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_lock_without_status_still_blocks() {
        let m = markers();
        m.init().unwrap();
        fs::write(m.dir().join(LOCK_FILE), "77").unwrap();

        assert!(matches!(
            m.acquire(false),
            Err(LifecycleError::AlreadyRunning { pid: Some(77) })
        ));
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_failed_claim_leaves_markers_startable() {
        let m = markers();
        m.init().unwrap();
        // A directory in place of the temp file makes the status write fail.
        let blocker = m.dir().join(format!(".{}.tmp", STATUS_FILE));
        fs::create_dir(&blocker).unwrap();

        assert!(matches!(m.acquire(false), Err(LifecycleError::Marker { .. })));
        assert_eq!(m.read_status().unwrap(), DaemonStatus { up: false, pid: None });
        assert!(!m.dir().join(LOCK_FILE).exists());

        fs::remove_dir(&blocker).unwrap();
        m.acquire(false).unwrap();
        assert!(m.read_status().unwrap().up);
        let _ = fs::remove_dir_all(m.dir());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DaemonStatus { up: true, pid: Some(9) }.to_string(), "up (pid 9)");
        assert_eq!(DaemonStatus { up: false, pid: None }.to_string(), "down");
    }
}
