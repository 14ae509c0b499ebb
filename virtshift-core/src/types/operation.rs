//! Operation tracking and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::TransferMethod;
use crate::error::ShiftError;

/// Kind of tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Clone,
    Sync,
}

impl OperationKind {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Sync => "sync",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal and non-terminal operation states.
///
/// Transitions only move forward: pending -> running -> one of the terminal
/// states. The registry enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this state ends the operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live progress of an operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes moved so far, summed across disks; monotonically non-decreasing
    pub bytes_transferred: u64,

    /// Total bytes expected
    pub total_bytes: u64,

    /// Exponentially smoothed transfer speed in bytes/second
    pub speed_bps: f64,

    /// Estimated seconds remaining, when the speed is meaningful
    pub eta_secs: Option<u64>,

    /// File currently being transferred
    pub current_file: Option<String>,
}

impl Progress {
    /// Completion percentage in [0, 100].
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

/// Externally observable snapshot of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: String,
    pub operation_type: OperationKind,
    pub status: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Final result of a clone operation (JSON wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneResult {
    pub operation_id: String,
    pub success: bool,
    pub vm_name: String,
    pub new_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    /// Wall-clock duration in seconds
    pub duration: f64,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Final result of a sync operation (JSON wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub operation_id: String,
    pub success: bool,
    pub vm_name: String,
    pub target_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    /// Wall-clock duration in seconds
    pub duration: f64,
    pub bytes_transferred: u64,
    pub blocks_synchronized: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Estimated differences between a source VM and its sync target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaReport {
    pub total_bytes: u64,
    pub changed_bytes: u64,
    pub changed_blocks: u64,
    pub files_changed: Vec<String>,
    pub estimated_transfer_secs: f64,
}

/// A planned disk transfer, reported by dry runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedDisk {
    pub source_path: String,
    pub dest_path: String,
    pub size_bytes: u64,
}

/// The plan a dry run reports instead of touching destination state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClonePlan {
    pub vm_name: String,
    pub new_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    /// Whether an existing destination VM would be cleaned up first
    pub would_cleanup: bool,
    pub disks: Vec<PlannedDisk>,
    pub transfer_method: TransferMethod,
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub estimated_duration_secs: f64,
    pub warnings: Vec<String>,
}

/// Structured error payload (JSON wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

/// Body of an [`ErrorResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorResponse {
    /// Build the wire shape from a core error.
    pub fn from_error(err: &ShiftError, operation_id: Option<String>) -> Self {
        Self {
            error: ErrorBody {
                code: err.code(),
                message: err.to_string(),
                details: err.remediation().map(|steps| steps.join("\n")),
                field: None,
            },
            timestamp: Utc::now(),
            operation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        let p = Progress { bytes_transferred: 512, total_bytes: 1024, ..Default::default() };
        assert!((p.percent() - 50.0).abs() < f64::EPSILON);

        let empty = Progress::default();
        assert_eq!(empty.percent(), 0.0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::Running.is_terminal());
        assert!(OperationState::Completed.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_response_shape() {
        let err = ShiftError::VmExists { name: "web01".to_string(), host: "h2".to_string() };
        let resp = ErrorResponse::from_error(&err, Some("op-1".to_string()));
        assert_eq!(resp.error.code, 1004);
        assert_eq!(resp.operation_id.as_deref(), Some("op-1"));
    }
}
