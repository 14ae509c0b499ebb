//! Domain types shared across the engine.

pub mod operation;
pub mod options;
pub mod vm;

pub use operation::{
    ClonePlan, CloneResult, DeltaReport, ErrorBody, ErrorResponse, OperationKind, OperationState,
    OperationStatus, PlannedDisk, Progress, SyncResult,
};
pub use options::{
    Bandwidth, CloneOptions, SyncOptions, TransferMethod, DEFAULT_CLONE_TIMEOUT_SECS,
    DEFAULT_SYNC_TIMEOUT_SECS, MAX_PARALLEL_TRANSFERS,
};
pub use vm::{DiskFormat, DiskRef, HostCapacity, NetworkInterface, VmDescriptor, VmRunState};
