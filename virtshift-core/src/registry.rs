//! Process-scope operation registry.
//!
//! Tracks every in-flight and recently finished operation so `status` can
//! observe progress and `cancel` can reach a running task. The registry is
//! constructed at program entry and passed down explicitly; terminal
//! operations are kept in a bounded history window.

use crate::cancel::CancelToken;
use crate::error::ShiftError;
use crate::types::{OperationKind, OperationState, OperationStatus, Progress};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Finished operations retained for status queries.
const DEFAULT_HISTORY_LIMIT: usize = 64;

struct OperationEntry {
    status: OperationStatus,
    cancel: CancelToken,
    /// Insertion counter for history eviction order
    seq: u64,
}

/// Handle returned when an operation is registered.
pub struct OperationTicket {
    pub operation_id: String,
    pub cancel: CancelToken,
}

/// Registry of operations for one process.
pub struct OperationRegistry {
    inner: Mutex<Inner>,
    history_limit: usize,
}

struct Inner {
    operations: HashMap<String, OperationEntry>,
    next_seq: u64,
}

impl OperationRegistry {
    /// Create a registry with the default history window.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a registry retaining at most `limit` finished operations.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { operations: HashMap::new(), next_seq: 0 }),
            history_limit: limit,
        }
    }

    /// Register a new pending operation.
    pub fn begin(&self, kind: OperationKind) -> OperationTicket {
        let operation_id = Uuid::new_v4().to_string();
        let cancel = CancelToken::new();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.operations.insert(
            operation_id.clone(),
            OperationEntry {
                status: OperationStatus {
                    operation_id: operation_id.clone(),
                    operation_type: kind,
                    status: OperationState::Pending,
                    progress: None,
                    created: Utc::now(),
                    started: None,
                    completed: None,
                    error: None,
                    result: None,
                },
                cancel: cancel.clone(),
                seq,
            },
        );
        debug!(operation_id = %operation_id, kind = %kind, "Operation registered");
        OperationTicket { operation_id, cancel }
    }

    /// Transition an operation to running.
    pub fn mark_running(&self, operation_id: &str) {
        self.mutate(operation_id, |status| {
            if status.status == OperationState::Pending {
                status.status = OperationState::Running;
                status.started = Some(Utc::now());
            }
        });
    }

    /// Update progress. Byte counts never move backwards.
    pub fn update_progress(&self, operation_id: &str, progress: Progress) {
        self.mutate(operation_id, |status| {
            if status.status.is_terminal() {
                return;
            }
            let bytes_floor =
                status.progress.as_ref().map(|p| p.bytes_transferred).unwrap_or(0);
            let mut progress = progress;
            progress.bytes_transferred = progress.bytes_transferred.max(bytes_floor);
            status.progress = Some(progress);
        });
    }

    /// Transition to completed with the final result payload.
    pub fn complete(&self, operation_id: &str, result: serde_json::Value) {
        self.finish(operation_id, OperationState::Completed, None, Some(result));
    }

    /// Transition to failed, or to cancelled for cancellation errors.
    pub fn fail(&self, operation_id: &str, error: &ShiftError) {
        let state = match error {
            ShiftError::Cancelled { .. } => OperationState::Cancelled,
            _ => OperationState::Failed,
        };
        self.finish(operation_id, state, Some(error.to_string()), None);
    }

    /// Fire the cancellation token of a live operation. Returns whether a
    /// cancellable operation was found.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.operations.get(operation_id) {
            Some(entry) if !entry.status.status.is_terminal() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Snapshot one operation.
    pub fn get(&self, operation_id: &str) -> Option<OperationStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.operations.get(operation_id).map(|e| e.status.clone())
    }

    /// Snapshot all operations, oldest first. With `active_only`, finished
    /// operations are filtered out.
    pub fn list(&self, active_only: bool) -> Vec<OperationStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = inner
            .operations
            .values()
            .filter(|e| !active_only || !e.status.status.is_terminal())
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.status.clone()).collect()
    }

    fn mutate(&self, operation_id: &str, f: impl FnOnce(&mut OperationStatus)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.operations.get_mut(operation_id) {
            f(&mut entry.status);
        }
    }

    fn finish(
        &self,
        operation_id: &str,
        state: OperationState,
        error: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.operations.get_mut(operation_id) {
            if entry.status.status.is_terminal() {
                return;
            }
            entry.status.status = state;
            entry.status.completed = Some(Utc::now());
            entry.status.error = error;
            entry.status.result = result;
        }

        // Evict the oldest finished operations beyond the history window.
        let mut finished: Vec<(String, u64)> = inner
            .operations
            .iter()
            .filter(|(_, e)| e.status.status.is_terminal())
            .map(|(id, e)| (id.clone(), e.seq))
            .collect();
        let excess = finished.len().saturating_sub(self.history_limit);
        if excess > 0 {
            finished.sort_by_key(|(_, seq)| *seq);
            for (id, _) in finished.into_iter().take(excess) {
                inner.operations.remove(&id);
            }
        }
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_forward_only() {
        let registry = OperationRegistry::new();
        let ticket = registry.begin(OperationKind::Clone);
        let id = ticket.operation_id.clone();

        assert_eq!(registry.get(&id).unwrap().status, OperationState::Pending);

        registry.mark_running(&id);
        assert_eq!(registry.get(&id).unwrap().status, OperationState::Running);

        registry.complete(&id, serde_json::json!({"ok": true}));
        assert_eq!(registry.get(&id).unwrap().status, OperationState::Completed);

        // Terminal states are frozen.
        registry.fail(&id, &ShiftError::General("late".to_string()));
        assert_eq!(registry.get(&id).unwrap().status, OperationState::Completed);
        registry.mark_running(&id);
        assert_eq!(registry.get(&id).unwrap().status, OperationState::Completed);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let registry = OperationRegistry::new();
        let ticket = registry.begin(OperationKind::Clone);
        let id = ticket.operation_id.clone();
        registry.mark_running(&id);

        registry.update_progress(&id, Progress { bytes_transferred: 100, ..Default::default() });
        registry.update_progress(&id, Progress { bytes_transferred: 50, ..Default::default() });

        let progress = registry.get(&id).unwrap().progress.unwrap();
        assert_eq!(progress.bytes_transferred, 100);
    }

    #[test]
    fn test_cancel_reaches_token() {
        let registry = OperationRegistry::new();
        let ticket = registry.begin(OperationKind::Sync);
        registry.mark_running(&ticket.operation_id);

        assert!(registry.cancel(&ticket.operation_id));
        assert!(ticket.cancel.is_cancelled());

        registry.fail(
            &ticket.operation_id,
            &ShiftError::Cancelled { operation_id: ticket.operation_id.clone() },
        );
        assert_eq!(
            registry.get(&ticket.operation_id).unwrap().status,
            OperationState::Cancelled
        );
        // A finished operation can no longer be cancelled.
        assert!(!registry.cancel(&ticket.operation_id));
    }

    #[test]
    fn test_unknown_operation() {
        let registry = OperationRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(!registry.cancel("missing"));
    }

    #[test]
    fn test_list_active_only() {
        let registry = OperationRegistry::new();
        let a = registry.begin(OperationKind::Clone);
        let b = registry.begin(OperationKind::Clone);
        registry.complete(&a.operation_id, serde_json::Value::Null);

        assert_eq!(registry.list(false).len(), 2);
        let active = registry.list(true);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].operation_id, b.operation_id);
    }
}
