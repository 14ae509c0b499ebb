//! Error types for virtshift.
//!
//! All errors use `thiserror` and carry a stable numeric code so that callers
//! (and the JSON output mode) can react to error classes without string
//! matching. Remediation steps for user-facing failures are data on the
//! variant's category, not behavior.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for virtshift operations.
pub type Result<T> = std::result::Result<T, ShiftError>;

/// Main error type for virtshift.
#[derive(Error, Debug)]
pub enum ShiftError {
    // System errors (1000-1099)
    #[error("{0}")]
    General(String),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Connection error to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("VM '{name}' not found on host '{host}'")]
    VmNotFound { name: String, host: String },

    #[error("VM '{name}' already exists on host '{host}'")]
    VmExists { name: String, host: String },

    #[error("Insufficient resources: {reason}")]
    InsufficientResources { reason: String },

    #[error("Transfer from {src_host} to {dest} failed: {reason}")]
    Transfer { src_host: String, dest: String, reason: String },

    #[error("Validation error: {reason}")]
    Validation { reason: String },

    #[error("Operation {operation_id} was cancelled")]
    Cancelled { operation_id: String },

    #[error("Hypervisor error during {operation}: {reason}")]
    Hypervisor { operation: String, reason: String },

    // Authentication errors (1100-1199)
    #[error("Authentication failed for {host}: {reason}")]
    Auth { host: String, reason: String },

    #[error("SSH key error for {path:?}: {reason}")]
    SshKey { path: PathBuf, reason: String },

    #[error("Permission denied for {resource}: {reason}")]
    PermissionDenied { resource: String, reason: String },

    #[error("Host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },

    // Operation errors (1200-1299)
    #[error("Clone failed: {reason}")]
    Clone { reason: String },

    #[error("Sync failed: {reason}")]
    Sync { reason: String },

    #[error("Timeout during {operation} after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },

    #[error("Not enough disk space at {path}: required {required} bytes, available {available} bytes")]
    DiskSpace { required: u64, available: u64, path: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    // Validation errors (1300-1399)
    #[error("Invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Invalid VM name '{name}': {reason}")]
    InvalidVmName { name: String, reason: String },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: i64 },

    #[error("Invalid timeout {seconds}: must be greater than zero")]
    InvalidTimeout { seconds: i64 },

    #[error("Invalid bandwidth limit '{value}': expected digits with optional K/M/G/T suffix")]
    InvalidBandwidth { value: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error category, used for exit-code mapping and remediation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    System,
    Authentication,
    Operation,
    Validation,
}

impl ShiftError {
    /// Stable numeric error code.
    pub fn code(&self) -> u32 {
        match self {
            Self::General(_) => 1000,
            Self::Configuration { .. } => 1001,
            Self::Connection { .. } => 1002,
            Self::VmNotFound { .. } => 1003,
            Self::VmExists { .. } => 1004,
            Self::InsufficientResources { .. } => 1005,
            Self::Transfer { .. } => 1006,
            Self::Validation { .. } => 1007,
            Self::Cancelled { .. } => 1008,
            Self::Hypervisor { .. } => 1009,
            Self::Auth { .. } => 1100,
            Self::SshKey { .. } => 1101,
            Self::PermissionDenied { .. } => 1102,
            Self::HostKey { .. } => 1103,
            Self::Clone { .. } => 1200,
            Self::Sync { .. } => 1201,
            Self::Timeout { .. } => 1202,
            Self::OperationNotFound { .. } => 1203,
            Self::DiskSpace { .. } => 1204,
            Self::Network { .. } => 1205,
            Self::InvalidHost { .. } => 1300,
            Self::InvalidVmName { .. } => 1301,
            Self::InvalidPath { .. } => 1302,
            Self::InvalidPort { .. } => 1303,
            Self::InvalidTimeout { .. } => 1304,
            Self::InvalidBandwidth { .. } => 1305,
            Self::Io { .. } => 1000,
        }
    }

    /// Short machine name for the error, stable across releases.
    pub fn name(&self) -> &'static str {
        match self {
            Self::General(_) => "general",
            Self::Configuration { .. } => "configuration",
            Self::Connection { .. } => "connection",
            Self::VmNotFound { .. } => "vm-not-found",
            Self::VmExists { .. } => "vm-exists",
            Self::InsufficientResources { .. } => "insufficient-resources",
            Self::Transfer { .. } => "transfer",
            Self::Validation { .. } => "validation",
            Self::Cancelled { .. } => "operation-cancelled",
            Self::Hypervisor { .. } => "hypervisor",
            Self::Auth { .. } => "auth",
            Self::SshKey { .. } => "ssh-key",
            Self::PermissionDenied { .. } => "permission-denied",
            Self::HostKey { .. } => "host-key",
            Self::Clone { .. } => "clone",
            Self::Sync { .. } => "sync",
            Self::Timeout { .. } => "operation-timeout",
            Self::OperationNotFound { .. } => "operation-not-found",
            Self::DiskSpace { .. } => "disk-space",
            Self::Network { .. } => "network",
            Self::InvalidHost { .. } => "invalid-host",
            Self::InvalidVmName { .. } => "invalid-vm-name",
            Self::InvalidPath { .. } => "invalid-path",
            Self::InvalidPort { .. } => "invalid-port",
            Self::InvalidTimeout { .. } => "invalid-timeout",
            Self::InvalidBandwidth { .. } => "invalid-bandwidth",
            Self::Io { .. } => "general",
        }
    }

    /// Category grouping per the error-code ranges.
    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            1100..=1199 => ErrorCategory::Authentication,
            1200..=1299 => ErrorCategory::Operation,
            1300..=1399 => ErrorCategory::Validation,
            _ => ErrorCategory::System,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. }
            | Self::InvalidHost { .. }
            | Self::InvalidVmName { .. }
            | Self::InvalidPath { .. }
            | Self::InvalidPort { .. }
            | Self::InvalidTimeout { .. }
            | Self::InvalidBandwidth { .. } => 2,
            Self::Connection { .. } | Self::Network { .. } => 3,
            Self::Auth { .. }
            | Self::SshKey { .. }
            | Self::PermissionDenied { .. }
            | Self::HostKey { .. } => 4,
            Self::VmNotFound { .. } => 5,
            Self::VmExists { .. } => 6,
            Self::InsufficientResources { .. } | Self::DiskSpace { .. } => 7,
            Self::Transfer { .. } => 8,
            Self::Cancelled { .. } => 9,
            Self::Timeout { .. } => 10,
            _ => 1,
        }
    }

    /// Whether a failed connect attempt with this error may be retried.
    ///
    /// Authentication and host-key failures are permanent; everything in the
    /// connection/network family is considered transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Network { .. })
    }

    /// Numbered remediation steps for user-facing failure classes.
    ///
    /// Returns `None` for errors that have no meaningful user action beyond
    /// reading the message.
    pub fn remediation(&self) -> Option<Vec<String>> {
        match self {
            Self::Auth { host, .. } => Some(vec![
                format!("Copy your public key to the host: ssh-copy-id {}", host),
                "Check keys loaded in your agent: ssh-add -l".to_string(),
                format!("Test connectivity manually: ssh {} true", host),
                "Set VIRTSHIFT_SSH_KEY_PATH to the correct private key".to_string(),
            ]),
            Self::SshKey { path, .. } => Some(vec![
                format!("Check that the key exists: ls -l {}", path.display()),
                format!("Restrict permissions to the owner: chmod 600 {}", path.display()),
                "Point VIRTSHIFT_SSH_KEY_PATH at a valid private key".to_string(),
            ]),
            Self::HostKey { host, .. } => Some(vec![
                format!("Inspect the host key entry: ssh-keygen -F {}", host),
                format!("Remove a stale entry: ssh-keygen -R {}", host),
                "Set VIRTSHIFT_SSH_HOST_KEY_POLICY=accept to trust new hosts".to_string(),
            ]),
            Self::Connection { host, .. } => Some(vec![
                format!("Check the host is reachable: ping -c 3 {}", host),
                format!("Check sshd is listening: ssh -v {} true", host),
                "Verify port/user overrides in ~/.ssh/config".to_string(),
            ]),
            _ => None,
        }
    }
}
