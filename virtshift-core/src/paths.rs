//! Centralized path configuration for virtshift.
//!
//! All persisted state goes through this module so the CLI and library agree
//! on locations whether running as root or a regular user.

use std::path::PathBuf;

/// Get the virtshift state directory.
///
/// Resolution order:
/// 1. `VIRTSHIFT_STATE_DIR` environment variable
/// 2. `/var/lib/virtshift` if it exists (system install)
/// 3. `~/.local/share/virtshift` for user installs
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VIRTSHIFT_STATE_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/virtshift");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::data_dir().map(|d| d.join("virtshift")).unwrap_or(system_dir)
}

/// Directory holding one JSON audit log per transaction.
pub fn transactions_dir() -> PathBuf {
    state_dir().join("transactions")
}

/// Audit log path for a transaction.
pub fn transaction_log_path(operation_id: &str) -> PathBuf {
    transactions_dir().join(format!("{}.json", operation_id))
}

/// Directory holding advisory lock files, keyed by destination host.
pub fn locks_dir() -> PathBuf {
    state_dir().join("locks")
}

/// Advisory lock path for a (destination host, VM name) pair.
pub fn lock_path(dest_host: &str, vm_name: &str) -> PathBuf {
    locks_dir().join(dest_host).join(format!("{}.lock", vm_name))
}

/// User configuration file path.
pub fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("virtshift").join("config.yaml"))
        .unwrap_or_else(|| PathBuf::from("virtshift.yaml"))
}

/// System configuration file path.
pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/virtshift/config.yaml")
}

/// Current-directory configuration file path.
pub fn local_config_path() -> PathBuf {
    PathBuf::from("virtshift.yaml")
}

/// Runtime directory for SSH control sockets.
///
/// Resolution order:
/// 1. `VIRTSHIFT_RUNTIME_DIR` environment variable
/// 2. `$XDG_RUNTIME_DIR/virtshift`
/// 3. `/run/virtshift` when running as root
/// 4. `/tmp/virtshift-runtime` as fallback
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VIRTSHIFT_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("virtshift");
    }

    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/run/virtshift");
        }
    }

    PathBuf::from("/tmp/virtshift-runtime")
}
