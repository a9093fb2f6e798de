use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::error::{Error, Result};

/// How long an unreadable lock file is assumed to be mid-acquisition.
const ACQUIRE_GRACE: Duration = Duration::from_secs(10);

/// PID lock file held for the duration of one run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match read_pid(path) {
                Some(pid) if pid != process::id() && process_alive(pid) => {
                    return Err(Error::Lock(format!(
                        "Another doctobot run is in progress (PID {}, lock {}).",
                        pid,
                        path.display()
                    )));
                }
                Some(pid) => {
                    warn!(pid, lock = %path.display(), "removing stale lock");
                    let _ = fs::remove_file(path);
                }
                // Empty or unparseable. A fresh file may belong to a run that
                // has created it but not yet written its PID.
                None if recently_modified(path) => {
                    return Err(Error::Lock(format!(
                        "Another doctobot run is acquiring the lock ({}).",
                        path.display()
                    )));
                }
                None => {
                    warn!(lock = %path.display(), "removing corrupt lock");
                    let _ = fs::remove_file(path);
                }
            }
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::Lock(format!("Failed to create lock file {}: {}", path.display(), e)))?;

        writeln!(file, "pid: {}", process::id())?;
        writeln!(file, "hostname: {}", get_hostname())?;
        writeln!(file, "timestamp: {}", Utc::now().to_rfc3339())?;

        Ok(RunLock {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Never remove a lock another run has taken over.
        if read_pid(&self.path) == Some(process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age < ACQUIRE_GRACE)
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("pid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

fn process_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{}", pid)).exists()
}

fn get_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
