//! Advisory locks for destination VM names.
//!
//! A destination `(host, vm name)` pair is effectively a mutex: two clones
//! targeting the same pair must not interleave. The lock is a local file
//! created with `O_EXCL` containing the holder's pid and start time; a lock
//! whose pid is no longer alive is stale and reclaimed.

use crate::error::{Result, ShiftError};
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Contents of a lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

/// Holds the advisory lock; releasing happens on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock for `(dest_host, vm_name)`.
    ///
    /// Fails when another live process holds it. A lock left behind by a
    /// dead process is reclaimed.
    pub fn acquire(dest_host: &str, vm_name: &str) -> Result<Self> {
        let path = paths::lock_path(dest_host, vm_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ShiftError::Io { path: parent.to_path_buf(), source: e })?;
        }

        match Self::try_create(&path) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Self::is_stale(&path) {
                    warn!(path = %path.display(), "Reclaiming stale lock");
                    let _ = std::fs::remove_file(&path);
                    Self::try_create(&path)
                        .map_err(|e| ShiftError::Io { path: path.clone(), source: e })
                } else {
                    Err(ShiftError::General(format!(
                        "another operation is already targeting '{}' on {} (lock: {})",
                        vm_name,
                        dest_host,
                        path.display()
                    )))
                }
            }
            Err(e) => Err(ShiftError::Io { path, source: e }),
        }
    }

    fn try_create(path: &PathBuf) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo { pid: std::process::id(), started_at: Utc::now() };
        let content = serde_json::to_string(&info).unwrap_or_default();
        file.write_all(content.as_bytes())?;
        debug!(path = %path.display(), "Lock acquired");
        Ok(Self { path: path.clone() })
    }

    /// A lock is stale when its recorded pid no longer exists, or its
    /// contents are unreadable.
    fn is_stale(path: &PathBuf) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            return true;
        };
        let Ok(info) = serde_json::from_str::<LockInfo>(&content) else {
            return true;
        };
        !process_alive(info.pid)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        } else {
            debug!(path = %self.path.display(), "Lock released");
        }
    }
}

/// Whether a process with this pid exists (signal 0 probe).
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0) succeeds, or fails with EPERM, when the process exists.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // The state-dir env var is process-global; serialize the tests that
    // touch it.
    static ENV_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_temp_state_dir<T>(f: impl FnOnce() -> T) -> T {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("VIRTSHIFT_STATE_DIR", dir.path());
        let result = f();
        std::env::remove_var("VIRTSHIFT_STATE_DIR");
        result
    }

    #[test]
    fn test_acquire_release_reacquire() {
        with_temp_state_dir(|| {
            let guard = LockGuard::acquire("h2", "web01_clone").unwrap();
            let path = guard.path.clone();
            assert!(path.exists());

            // Second acquisition by this live process fails.
            assert!(LockGuard::acquire("h2", "web01_clone").is_err());

            drop(guard);
            assert!(!path.exists());
            let _guard = LockGuard::acquire("h2", "web01_clone").unwrap();
        });
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        with_temp_state_dir(|| {
            let path = paths::lock_path("h2", "web01_clone");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            // Pid 0 never names a real peer process; u32::MAX is not a
            // valid pid either.
            let stale = LockInfo { pid: u32::MAX - 1, started_at: Utc::now() };
            std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

            let guard = LockGuard::acquire("h2", "web01_clone");
            assert!(guard.is_ok());
        });
    }

    #[test]
    fn test_garbage_lock_reclaimed() {
        with_temp_state_dir(|| {
            let path = paths::lock_path("h2", "web01_clone");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "not json").unwrap();
            assert!(LockGuard::acquire("h2", "web01_clone").is_ok());
        });
    }

    #[test]
    fn test_different_names_do_not_conflict() {
        with_temp_state_dir(|| {
            let _a = LockGuard::acquire("h2", "web01_clone").unwrap();
            let _b = LockGuard::acquire("h2", "other").unwrap();
            let _c = LockGuard::acquire("h3", "web01_clone").unwrap();
        });
    }
}
