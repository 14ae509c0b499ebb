//! Cooperative cancellation.
//!
//! A [`CancelToken`] is cloned into every long-running task of an operation.
//! I/O loops check it at their natural boundaries (progress ticks, phase
//! transitions) and unwind with `ShiftError::Cancelled`.

use crate::error::{Result, ShiftError};
use std::sync::Arc;
use tokio::sync::watch;

/// Clonable cancellation signal for one operation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive through self; unreachable, but do not spin.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Error out when cancelled, for use at phase boundaries.
    pub fn check(&self, operation_id: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ShiftError::Cancelled { operation_id: operation_id.to_string() });
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_flow() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("op-1").is_ok());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                true
            })
        };

        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check("op-1"), Err(ShiftError::Cancelled { .. })));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
