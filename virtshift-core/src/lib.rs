//! virtshift core library.
//!
//! Engine for cloning and incrementally synchronizing libvirt-managed VMs
//! between hosts over SSH: secure command assembly, multiplexed transport,
//! hypervisor adapter, transfer strategies, transactional orchestration.

pub mod cancel;
pub mod clone;
pub mod command;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod registry;
pub mod sync;
pub mod transaction;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use cancel::CancelToken;
pub use clone::{CloneOutcome, Cloner};
pub use config::{AppConfig, HostKeyPolicy};
pub use error::{ErrorCategory, Result, ShiftError};
pub use hypervisor::Hypervisor;
pub use registry::{OperationRegistry, OperationTicket};
pub use sync::Synchronizer;
pub use transaction::{ResourceKind, Transaction, TransactionLog, TransactionStatus};
pub use transport::{Connection, ExecOutput, SshTransport, Transport};
pub use types::{
    Bandwidth, ClonePlan, CloneOptions, CloneResult, DeltaReport, ErrorResponse, HostCapacity,
    OperationKind, OperationState, OperationStatus, Progress, SyncOptions, SyncResult,
    TransferMethod, VmDescriptor, VmRunState,
};
