//! Single-instance lock so two supervisors never drive the same workspace at once.

use crate::log_debug;
use crate::process_signal::process_exists;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Contents of the lock file, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub hostname: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Another live supervisor holds the lock; not recoverable for this run.
    #[error("another kickoff instance is running (pid {pid}, started {start_time})")]
    Busy {
        pid: u32,
        start_time: DateTime<Utc>,
    },
    #[error("lock file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Held single-instance lock. Releases on `release()` or drop, whichever first.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    held: AtomicBool,
}

impl InstanceLock {
    /// Acquire the workspace lock, reclaiming it when the recorded owner is dead.
    pub fn acquire(lock_path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if lock_path.exists() {
            match read_lock_info(lock_path) {
                Some(info) if process_exists(info.pid as i32) => {
                    return Err(LockError::Busy {
                        pid: info.pid,
                        start_time: info.start_time,
                    });
                }
                Some(info) => {
                    log_debug(&format!(
                        "reclaiming stale lock from dead pid {} at {}",
                        info.pid,
                        lock_path.display()
                    ));
                    fs::remove_file(lock_path)?;
                }
                None => {
                    log_debug(&format!(
                        "removing unparseable lock file at {}",
                        lock_path.display()
                    ));
                    fs::remove_file(lock_path)?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            start_time: Utc::now(),
            hostname: local_hostname(),
        };
        fs::write(lock_path, serde_json::to_string_pretty(&info)?)?;

        Ok(Self {
            path: lock_path.to_path_buf(),
            held: AtomicBool::new(true),
        })
    }

    /// Remove the lock file if this instance holds it. Safe to call repeatedly
    /// and from any exit path; a missing file is a no-op.
    pub fn release(&self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log_debug(&format!(
                    "failed to remove lock file {}: {err}",
                    self.path.display()
                ));
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff the lock file at `lock_path` parses and its owner is dead.
    pub fn is_stale(lock_path: &Path) -> bool {
        match read_lock_info(lock_path) {
            Some(info) => !process_exists(info.pid as i32),
            None => false,
        }
    }

    /// Current lock file contents, if present and parseable.
    pub fn read(lock_path: &Path) -> Option<LockInfo> {
        read_lock_info(lock_path)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static TEST_SEQ: AtomicU64 = AtomicU64::new(0);

    fn test_lock_path(label: &str) -> PathBuf {
        let pid = std::process::id();
        let seq = TEST_SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("kickoff-lock-test-{label}-{pid}-{seq}"))
            .join("kickoff.lock")
    }

    fn remove_test_dir(lock_path: &Path) {
        if let Some(dir) = lock_path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn acquire_writes_current_pid() {
        let path = test_lock_path("acquire");
        let lock = InstanceLock::acquire(&path).expect("acquire lock");
        let info = InstanceLock::read(&path).expect("read lock info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        lock.release();
        remove_test_dir(&path);
    }

    #[test]
    fn second_acquire_fails_busy_while_owner_alive() {
        let path = test_lock_path("busy");
        let lock = InstanceLock::acquire(&path).expect("acquire lock");
        match InstanceLock::acquire(&path) {
            Err(LockError::Busy { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Busy, got {other:?}"),
        }
        lock.release();
        remove_test_dir(&path);
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let path = test_lock_path("stale");
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        let stale = LockInfo {
            pid: 999_999_999,
            start_time: "2020-01-01T00:00:00Z".parse().expect("timestamp"),
            hostname: "h".to_string(),
        };
        fs::write(&path, serde_json::to_string(&stale).expect("encode")).expect("seed lock");
        assert!(InstanceLock::is_stale(&path));

        let lock = InstanceLock::acquire(&path).expect("reclaim stale lock");
        let info = InstanceLock::read(&path).expect("read lock info");
        assert_eq!(info.pid, std::process::id());
        lock.release();
        remove_test_dir(&path);
    }

    #[test]
    fn unparseable_lock_is_reclaimed() {
        let path = test_lock_path("garbage");
        fs::create_dir_all(path.parent().expect("parent")).expect("create dir");
        fs::write(&path, "not json").expect("seed lock");
        assert!(!InstanceLock::is_stale(&path), "garbage does not parse");

        let lock = InstanceLock::acquire(&path).expect("reclaim unparseable lock");
        lock.release();
        remove_test_dir(&path);
    }

    #[test]
    fn release_is_idempotent_and_missing_file_is_ok() {
        let path = test_lock_path("release");
        let lock = InstanceLock::acquire(&path).expect("acquire lock");
        lock.release();
        assert!(!path.exists());
        lock.release();
        lock.release();
        remove_test_dir(&path);
    }

    #[test]
    fn drop_releases_the_lock() {
        let path = test_lock_path("drop");
        {
            let _lock = InstanceLock::acquire(&path).expect("acquire lock");
            assert!(path.exists());
        }
        assert!(!path.exists());
        remove_test_dir(&path);
    }
}
