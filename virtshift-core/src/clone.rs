//! Clone orchestration.
//!
//! Composes the transport, hypervisor adapter, transfer engine and
//! transaction manager into the end-to-end preflight -> transfer ->
//! materialize -> commit workflow. Any error after the transaction opens
//! triggers rollback, so a failed clone leaves the destination untouched
//! apart from its transaction log.

use crate::cancel::CancelToken;
use crate::command;
use crate::error::{Result, ShiftError};
use crate::hypervisor::{DefinitionRewrite, Hypervisor};
use crate::lock::LockGuard;
use crate::registry::OperationRegistry;
use crate::transaction::Transaction;
use crate::transfer::{self, TransferSpec, TransferTick};
use crate::transport::{Connection, Transport};
use crate::types::{
    ClonePlan, CloneOptions, CloneResult, HostCapacity, OperationKind, PlannedDisk, Progress,
    VmDescriptor, VmRunState,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

/// Extra free space demanded beyond the summed disk sizes.
const SPACE_SAFETY_MARGIN: f64 = 1.15;

/// Smoothing factor for the transfer-speed moving average.
const SPEED_EMA_ALPHA: f64 = 0.3;

/// Assumed throughput for dry-run duration estimates when no bandwidth
/// limit narrows it down (100 MiB/s).
const ESTIMATE_BYTES_PER_SEC: f64 = 100.0 * 1024.0 * 1024.0;

/// What a clone invocation produced.
#[derive(Debug, Clone)]
pub enum CloneOutcome {
    /// Dry run: the plan, destination untouched
    Plan(ClonePlan),
    /// Real run: the final result
    Completed(CloneResult),
}

/// Preflight findings carried into execution.
struct Preflight {
    source_vm: VmDescriptor,
    capacity: HostCapacity,
    new_name: String,
    target_exists: bool,
    planned: Vec<PlannedDisk>,
    required_bytes: u64,
    warnings: Vec<String>,
}

/// Drives clone operations end to end.
#[derive(Clone)]
pub struct Cloner {
    transport: Arc<dyn Transport>,
    hypervisor: Hypervisor,
    registry: Arc<OperationRegistry>,
    image_dir: String,
}

impl Cloner {
    /// Create a cloner.
    pub fn new(
        transport: Arc<dyn Transport>,
        hypervisor: Hypervisor,
        registry: Arc<OperationRegistry>,
        image_dir: impl Into<String>,
    ) -> Self {
        Self { transport, hypervisor, registry, image_dir: image_dir.into() }
    }

    /// Clone `vm_name` from `source_host` to `dest_host`.
    ///
    /// Runs under the operation deadline from `opts.timeout_secs`; hitting
    /// it cancels in-flight work, waits for rollback to finish, and
    /// surfaces a timeout error.
    #[instrument(skip(self, opts), fields(vm = vm_name))]
    pub async fn clone(
        &self,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        opts: CloneOptions,
    ) -> Result<CloneOutcome> {
        opts.validate()?;
        command::validate_hostname(source_host)?;
        command::validate_hostname(dest_host)?;
        command::validate_vm_name(vm_name)?;

        let ticket = self.registry.begin(OperationKind::Clone);
        let operation_id = ticket.operation_id.clone();
        let cancel = ticket.cancel.clone();
        let deadline = Duration::from_secs(opts.timeout_secs);

        info!(
            operation_id = %operation_id,
            source = source_host,
            dest = dest_host,
            "Starting clone operation"
        );

        let mut task = {
            // The inherent `clone` method shadows the derived impl.
            let this = Clone::clone(self);
            let (operation_id, cancel) = (operation_id.clone(), cancel.clone());
            let (source_host, dest_host, vm_name) =
                (source_host.to_string(), dest_host.to_string(), vm_name.to_string());
            tokio::spawn(async move {
                this.run(&operation_id, &source_host, &dest_host, &vm_name, opts, cancel).await
            })
        };

        let result = tokio::select! {
            res = &mut task => flatten_join(res),
            _ = tokio::time::sleep(deadline) => {
                warn!(operation_id = %operation_id, "Deadline exceeded, cancelling");
                cancel.cancel();
                // The task finishes its rollback before returning.
                match flatten_join(task.await) {
                    Err(ShiftError::Cancelled { .. }) => Err(ShiftError::Timeout {
                        operation: "clone".to_string(),
                        seconds: deadline.as_secs(),
                    }),
                    other => other,
                }
            }
        };

        match &result {
            Ok(CloneOutcome::Completed(r)) => {
                self.registry.complete(&operation_id, serde_json::to_value(r).unwrap_or_default());
            }
            Ok(CloneOutcome::Plan(p)) => {
                self.registry.complete(&operation_id, serde_json::to_value(p).unwrap_or_default());
            }
            Err(e) => self.registry.fail(&operation_id, e),
        }
        result
    }

    /// The operation body, running inside its own task so deadline expiry
    /// never drops a rollback in progress.
    async fn run(
        &self,
        operation_id: &str,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        opts: CloneOptions,
        cancel: CancelToken,
    ) -> Result<CloneOutcome> {
        self.registry.mark_running(operation_id);
        let started = Instant::now();

        let source_conn = self.transport.connect(source_host).await?;
        let dest_conn = self.transport.connect(dest_host).await?;

        let preflight =
            self.preflight(source_conn.as_ref(), dest_conn.as_ref(), vm_name, &opts).await?;

        if opts.dry_run {
            return Ok(CloneOutcome::Plan(self.build_plan(
                source_host,
                dest_host,
                vm_name,
                &opts,
                &preflight,
            )));
        }

        cancel.check(operation_id)?;

        // The destination name is a mutex across concurrent invocations.
        let _lock = LockGuard::acquire(dest_host, &preflight.new_name)?;

        if preflight.target_exists {
            info!(
                operation_id = %operation_id,
                vm = %preflight.new_name,
                host = dest_host,
                disks = preflight.source_vm.disks.len(),
                "Removing existing destination VM before clone"
            );
            self.hypervisor.cleanup_vm(dest_conn.as_ref(), &preflight.new_name).await?;
        }

        let mut txn = Transaction::begin(
            operation_id,
            OperationKind::Clone,
            self.transport.clone(),
            self.hypervisor.clone(),
        )
        .await?;

        let execution = self
            .execute(
                &mut txn,
                operation_id,
                &source_conn,
                &dest_conn,
                dest_host,
                &preflight,
                &opts,
                &cancel,
            )
            .await;

        match execution {
            Ok(bytes_transferred) => {
                let result = CloneResult {
                    operation_id: operation_id.to_string(),
                    success: true,
                    vm_name: vm_name.to_string(),
                    new_vm_name: preflight.new_name.clone(),
                    source_host: source_host.to_string(),
                    dest_host: dest_host.to_string(),
                    duration: started.elapsed().as_secs_f64(),
                    bytes_transferred,
                    error: None,
                    error_code: None,
                    warnings: preflight.warnings.clone(),
                    timestamp: Utc::now(),
                };
                info!(
                    operation_id = %operation_id,
                    vm = %preflight.new_name,
                    bytes = bytes_transferred,
                    "Clone completed"
                );
                Ok(CloneOutcome::Completed(result))
            }
            Err(e) => {
                let e = normalize_cancel(e, operation_id);
                txn.set_error(&e);
                // Rollback failures are logged inside; the original error
                // is never replaced by them.
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        operation_id = %operation_id,
                        error = %rollback_err,
                        "Rollback reported an error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Read-only validation phase, performed before any side effect.
    async fn preflight(
        &self,
        source_conn: &dyn Connection,
        dest_conn: &dyn Connection,
        vm_name: &str,
        opts: &CloneOptions,
    ) -> Result<Preflight> {
        let source_vm = self.hypervisor.get_vm(source_conn, vm_name).await?;
        if source_vm.state == VmRunState::Crashed {
            return Err(ShiftError::Clone {
                reason: format!("source VM '{}' is in a crashed state", vm_name),
            });
        }

        let mut warnings = Vec::new();
        if source_vm.state == VmRunState::Running {
            warnings.push(format!(
                "VM '{}' is running; the copied disks may be inconsistent. Consider stopping it first.",
                vm_name
            ));
        }

        let capacity = self.hypervisor.host_capacity(dest_conn).await?;
        let total_bytes = source_vm.total_disk_bytes();
        let required_bytes = (total_bytes as f64 * SPACE_SAFETY_MARGIN) as u64;
        if capacity.available_disk_bytes <= required_bytes {
            return Err(ShiftError::DiskSpace {
                required: required_bytes,
                available: capacity.available_disk_bytes,
                path: self.image_dir.clone(),
            });
        }

        if capacity.available_memory_mib < source_vm.memory_mib {
            warnings.push(format!(
                "destination has {} MiB free memory, source VM wants {} MiB",
                capacity.available_memory_mib, source_vm.memory_mib
            ));
        }
        if capacity.available_vcpus < source_vm.vcpus {
            warnings.push(format!(
                "destination has {} unclaimed vCPUs, source VM wants {}",
                capacity.available_vcpus, source_vm.vcpus
            ));
        }

        let new_name = opts.effective_new_name(vm_name);
        command::validate_vm_name(&new_name)?;

        let target_exists = self.hypervisor.vm_exists(dest_conn, &new_name).await?;
        if target_exists && !opts.overwrite_existing() {
            return Err(ShiftError::VmExists {
                name: new_name,
                host: dest_conn.host().to_string(),
            });
        }

        let mut planned = Vec::new();
        for disk in &source_vm.disks {
            let file_name = format!("{}_{}", new_name, sanitize_file_name(disk.basename()));
            let dest_path = format!("{}/{}", self.image_dir.trim_end_matches('/'), file_name);
            command::validate_path(&dest_path, Some(&self.image_dir))?;
            planned.push(PlannedDisk {
                source_path: disk.path.clone(),
                dest_path,
                size_bytes: disk.size_bytes,
            });
        }

        Ok(Preflight {
            source_vm,
            capacity,
            new_name,
            target_exists,
            planned,
            required_bytes,
            warnings,
        })
    }

    /// Build the dry-run plan.
    fn build_plan(
        &self,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        opts: &CloneOptions,
        preflight: &Preflight,
    ) -> ClonePlan {
        let total_bytes = preflight.source_vm.total_disk_bytes();
        let rate = opts
            .bandwidth_limit
            .as_ref()
            .map(|b| (b.kib_per_sec() as f64 * 1024.0).min(ESTIMATE_BYTES_PER_SEC))
            .filter(|r| *r > 0.0)
            .unwrap_or(ESTIMATE_BYTES_PER_SEC);

        ClonePlan {
            vm_name: vm_name.to_string(),
            new_vm_name: preflight.new_name.clone(),
            source_host: source_host.to_string(),
            dest_host: dest_host.to_string(),
            would_cleanup: preflight.target_exists,
            disks: preflight.planned.clone(),
            transfer_method: opts.transfer_method,
            required_bytes: preflight.required_bytes,
            available_bytes: preflight.capacity.available_disk_bytes,
            estimated_duration_secs: total_bytes as f64 / rate,
            warnings: preflight.warnings.clone(),
        }
    }

    /// Side-effecting phase: staging, transfers, rewrite, define, commit.
    /// Every step registers its effects in the transaction first, so the
    /// caller can roll back on any error.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        txn: &mut Transaction,
        operation_id: &str,
        source_conn: &Arc<dyn Connection>,
        dest_conn: &Arc<dyn Connection>,
        dest_host: &str,
        preflight: &Preflight,
        opts: &CloneOptions,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let staging_dir = format!(
            "{}/.virtshift-staging-{}",
            self.image_dir.trim_end_matches('/'),
            operation_id
        );

        let mkdir = command::mkdir(&staging_dir)?;
        let output = dest_conn.execute(&mkdir, None).await?;
        if !output.success() {
            return Err(ShiftError::Clone {
                reason: format!("failed to create staging directory: {}", output.stderr.trim()),
            });
        }
        txn.register_staging_dir(&staging_dir, dest_host).await?;

        let total_bytes = preflight.source_vm.total_disk_bytes();
        let (tick_tx, tick_rx) = mpsc::channel::<TransferTick>(256);
        let aggregator = tokio::spawn(aggregate_progress(
            self.registry.clone(),
            operation_id.to_string(),
            total_bytes,
            tick_rx,
        ));

        let semaphore = Arc::new(Semaphore::new(opts.parallel as usize));
        let mut transfers: JoinSet<Result<(String, String, u64)>> = JoinSet::new();

        for plan in &preflight.planned {
            let staging_path = format!(
                "{}/{}",
                staging_dir,
                plan.dest_path.rsplit('/').next().unwrap_or_default()
            );
            let spec = TransferSpec {
                source_host: source_conn.host().to_string(),
                source_path: plan.source_path.clone(),
                dest_host: dest_host.to_string(),
                dest_path: staging_path.clone(),
                bandwidth: opts.bandwidth_limit.clone(),
                verify: opts.verify,
            };
            let final_path = plan.dest_path.clone();
            let method = opts.transfer_method;
            let source = source_conn.clone();
            let dest = dest_conn.clone();
            let semaphore = semaphore.clone();
            let tick_tx = tick_tx.clone();
            let cancel = cancel.clone();

            transfers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    ShiftError::General("transfer semaphore closed".to_string())
                })?;
                let outcome =
                    transfer::run(method, source.as_ref(), dest.as_ref(), &spec, tick_tx, cancel)
                        .await?;
                Ok((spec.dest_path, final_path, outcome.bytes_transferred))
            });
        }
        drop(tick_tx);

        let mut bytes_transferred = 0u64;
        let mut first_error: Option<ShiftError> = None;
        while let Some(joined) = transfers.join_next().await {
            match flatten_join(joined) {
                Ok((staging_path, final_path, bytes)) => {
                    txn.register_temp_disk(&staging_path, dest_host, &final_path).await?;
                    bytes_transferred += bytes;
                }
                Err(e) => {
                    if first_error.is_none() {
                        // Stop the remaining transfers at their next
                        // progress boundary.
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }
        let _ = aggregator.await;

        if let Some(e) = first_error {
            // Keep the first real failure; peers unwound with Cancelled.
            return Err(e);
        }
        cancel.check(operation_id)?;

        let rewrite = DefinitionRewrite {
            new_name: preflight.new_name.clone(),
            disk_path_map: preflight
                .planned
                .iter()
                .map(|p| (p.source_path.clone(), p.dest_path.clone()))
                .collect(),
            preserve_mac: opts.preserve_mac,
            network_map: opts.network_map.clone(),
        };
        let rewritten =
            self.hypervisor.rewrite_definition(&preflight.source_vm.definition_xml, &rewrite)?;

        let defined = self.hypervisor.define_vm(dest_conn.as_ref(), &rewritten.xml).await?;
        txn.register_vm(&defined.name, dest_host).await?;

        txn.commit(Some(cancel)).await?;
        Ok(bytes_transferred)
    }
}

/// Fold per-disk ticks into the operation's progress, smoothing speed with
/// an exponential moving average and deriving the ETA from it.
pub(crate) async fn aggregate_progress(
    registry: Arc<OperationRegistry>,
    operation_id: String,
    total_bytes: u64,
    mut ticks: mpsc::Receiver<TransferTick>,
) {
    let mut per_file: HashMap<String, u64> = HashMap::new();
    let mut ema_bps = 0.0f64;
    let mut last_update = Instant::now();
    let mut last_total = 0u64;

    while let Some(tick) = ticks.recv().await {
        let entry = per_file.entry(tick.dest_path.clone()).or_insert(0);
        *entry = (*entry).max(tick.bytes);
        let transferred: u64 = per_file.values().sum();

        let elapsed = last_update.elapsed().as_secs_f64();
        if elapsed < 0.25 {
            continue;
        }
        let instantaneous = (transferred.saturating_sub(last_total)) as f64 / elapsed;
        ema_bps = if ema_bps == 0.0 {
            instantaneous
        } else {
            SPEED_EMA_ALPHA * instantaneous + (1.0 - SPEED_EMA_ALPHA) * ema_bps
        };
        let eta_secs = if ema_bps >= 1.0 {
            Some((total_bytes.saturating_sub(transferred) as f64 / ema_bps) as u64)
        } else {
            None
        };

        registry.update_progress(
            &operation_id,
            Progress {
                bytes_transferred: transferred,
                total_bytes,
                speed_bps: ema_bps,
                eta_secs,
                current_file: Some(tick.dest_path),
            },
        );
        last_update = Instant::now();
        last_total = transferred;
    }

    // Final snapshot so completed transfers read 100%.
    let transferred: u64 = per_file.values().sum();
    if transferred > 0 {
        registry.update_progress(
            &operation_id,
            Progress {
                bytes_transferred: transferred,
                total_bytes,
                speed_bps: ema_bps,
                eta_secs: Some(0),
                current_file: None,
            },
        );
    }
}

/// Replace path-hostile characters so the clone's file name stays inside
/// the allowed character set.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Collapse a join error into the operation error type.
pub(crate) fn flatten_join<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ShiftError::General(format!("task panicked: {}", e))),
    }
}

/// Give deep cancellation errors the real operation id.
pub(crate) fn normalize_cancel(error: ShiftError, operation_id: &str) -> ShiftError {
    match error {
        ShiftError::Cancelled { .. } => {
            ShiftError::Cancelled { operation_id: operation_id.to_string() }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("web01.qcow2"), "web01.qcow2");
        assert_eq!(sanitize_file_name("disk one?.img"), "disk_one_.img");
        assert_eq!(sanitize_file_name("a/b"), "a_b");
    }

    #[test]
    fn test_normalize_cancel() {
        let e = normalize_cancel(ShiftError::Cancelled { operation_id: String::new() }, "op-9");
        assert!(matches!(e, ShiftError::Cancelled { operation_id } if operation_id == "op-9"));

        let passthrough =
            normalize_cancel(ShiftError::General("x".to_string()), "op-9");
        assert!(matches!(passthrough, ShiftError::General(_)));
    }
}
