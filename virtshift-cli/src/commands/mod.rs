//! CLI command implementations.

pub mod clone;
pub mod config;
pub mod list;
pub mod status;
pub mod sync;

use crate::output::OutputMode;
use std::sync::Arc;
use virtshift_core::{AppConfig, Hypervisor, OperationRegistry, Transport};

/// Shared context handed to every command.
pub struct AppContext {
    pub config: AppConfig,
    pub transport: Arc<dyn Transport>,
    pub hypervisor: Hypervisor,
    pub registry: Arc<OperationRegistry>,
    pub output: OutputMode,
    pub quiet: bool,
}

/// Cancel every live operation when Ctrl-C arrives.
pub fn spawn_cancel_on_ctrl_c(registry: Arc<OperationRegistry>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling operations");
            for op in registry.list(true) {
                registry.cancel(&op.operation_id);
            }
        }
    });
}
