//! End-to-end clone orchestration tests.
//!
//! These drive the full preflight -> transfer -> define -> commit workflow
//! against an in-memory mock cluster, verifying the transactional
//! guarantees: a failed or cancelled clone leaves the destination
//! untouched, and idempotent reruns converge.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{Cluster, MockTransport, GIB};
use virtshift_core::clone::{CloneOutcome, Cloner};
use virtshift_core::error::ShiftError;
use virtshift_core::hypervisor::Hypervisor;
use virtshift_core::registry::OperationRegistry;
use virtshift_core::transaction::{TransactionLog, TransactionStatus};
use virtshift_core::types::{CloneOptions, OperationState};
use virtshift_core::paths;

const IMAGE_DIR: &str = "/var/lib/libvirt/images";

fn make_cloner(cluster: &Arc<Cluster>) -> (Cloner, Arc<OperationRegistry>) {
    support::init_state_dir();
    let transport = MockTransport::new(cluster.clone());
    let registry = Arc::new(OperationRegistry::new());
    let cloner = Cloner::new(
        transport,
        Hypervisor::new("qemu:///system"),
        registry.clone(),
        IMAGE_DIR,
    );
    (cloner, registry)
}

async fn load_log(operation_id: &str) -> TransactionLog {
    TransactionLog::load(&paths::transaction_log_path(operation_id))
        .await
        .expect("transaction log should exist")
}

#[tokio::test]
async fn test_happy_clone_with_verify() {
    let cluster = Cluster::new(&["t1src", "t1dst"]);
    cluster.add_vm("t1src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 10 * GIB)]);
    let (cloner, _registry) = make_cloner(&cluster);

    let opts = CloneOptions { verify: true, ..Default::default() };
    let outcome = cloner.clone("t1src", "t1dst", "web01", opts).await.expect("clone should succeed");

    let result = match outcome {
        CloneOutcome::Completed(r) => r,
        CloneOutcome::Plan(_) => panic!("expected a completed clone"),
    };
    assert!(result.success);
    assert_eq!(result.new_vm_name, "web01_clone");
    assert_eq!(result.bytes_transferred, 10 * GIB);

    // The disk landed at its canonical final path, and nothing is left in
    // staging.
    let files = cluster.files_on("t1dst");
    assert_eq!(files, vec![format!("{}/web01_clone_web01.qcow2", IMAGE_DIR)]);

    // The VM is defined with the new name, a fresh UUID and a fresh MAC.
    assert_eq!(cluster.vm_names_on("t1dst"), vec!["web01_clone".to_string()]);
    let dest_xml = cluster.with_host("t1dst", |s| s.vms["web01_clone"].clone());
    assert!(dest_xml.contains("<name>web01_clone</name>"));
    assert!(!dest_xml.contains("9e2b8c4a-0000-4000-8000"));
    assert!(!dest_xml.contains("52:54:00:11:22:33"));
    assert!(dest_xml.contains(&format!("{}/web01_clone_web01.qcow2", IMAGE_DIR)));

    // Source is untouched.
    assert_eq!(cluster.vm_names_on("t1src"), vec!["web01".to_string()]);

    let log = load_log(&result.operation_id).await;
    assert_eq!(log.status, TransactionStatus::Committed);
}

#[tokio::test]
async fn test_preserve_mac() {
    let cluster = Cluster::new(&["t2src", "t2dst"]);
    cluster.add_vm("t2src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), GIB)]);
    let (cloner, _registry) = make_cloner(&cluster);

    let opts = CloneOptions { preserve_mac: true, ..Default::default() };
    cloner.clone("t2src", "t2dst", "web01", opts).await.expect("clone should succeed");

    let dest_xml = cluster.with_host("t2dst", |s| s.vms["web01_clone"].clone());
    assert!(dest_xml.contains("52:54:00:11:22:33"));
}

#[tokio::test]
async fn test_name_collision_without_force() {
    let cluster = Cluster::new(&["t3src", "t3dst"]);
    cluster.add_vm("t3src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), GIB)]);
    cluster.add_vm("t3dst", "web01_clone", &[(format!("{}/old.qcow2", IMAGE_DIR).as_str(), GIB)]);
    let (cloner, _registry) = make_cloner(&cluster);

    let err = cloner
        .clone("t3src", "t3dst", "web01", CloneOptions::default())
        .await
        .expect_err("collision should fail");
    assert!(matches!(err, ShiftError::VmExists { .. }));
    assert_eq!(err.exit_code(), 6);

    // Failure happened before any transfer.
    assert!(!cluster.executed_commands().iter().any(|(_, cmd)| cmd.starts_with("rsync")));
    // The pre-existing VM and its disk are intact.
    assert_eq!(cluster.vm_names_on("t3dst"), vec!["web01_clone".to_string()]);
    assert_eq!(cluster.files_on("t3dst"), vec![format!("{}/old.qcow2", IMAGE_DIR)]);
}

#[tokio::test]
async fn test_insufficient_space_preflight() {
    let cluster = Cluster::new(&["t4src", "t4dst"]);
    cluster.add_vm("t4src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 50 * GIB)]);
    cluster.with_host("t4dst", |s| s.pool_available = 55 * GIB);
    let (cloner, _registry) = make_cloner(&cluster);

    let err = cloner
        .clone("t4src", "t4dst", "web01", CloneOptions::default())
        .await
        .expect_err("preflight should fail");
    assert!(matches!(err, ShiftError::DiskSpace { .. }));
    assert_eq!(err.exit_code(), 7);
    assert!(!cluster.executed_commands().iter().any(|(_, cmd)| cmd.starts_with("rsync")));
}

#[tokio::test]
async fn test_exact_space_boundary_fails() {
    let cluster = Cluster::new(&["t5src", "t5dst"]);
    cluster.add_vm("t5src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 10 * GIB)]);
    let required = (10.0 * GIB as f64 * 1.15) as u64;
    cluster.with_host("t5dst", |s| s.pool_available = required);
    let (cloner, _registry) = make_cloner(&cluster);

    let err = cloner
        .clone("t5src", "t5dst", "web01", CloneOptions::default())
        .await
        .expect_err("equal space must not pass");
    assert!(matches!(err, ShiftError::DiskSpace { .. }));
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let cluster = Cluster::new(&["t6src", "t6dst"]);
    cluster.add_vm("t6src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 4 * GIB)]);
    let (cloner, _registry) = make_cloner(&cluster);

    let opts = CloneOptions { dry_run: true, ..Default::default() };
    let outcome = cloner.clone("t6src", "t6dst", "web01", opts).await.expect("dry run succeeds");

    let plan = match outcome {
        CloneOutcome::Plan(p) => p,
        CloneOutcome::Completed(_) => panic!("dry run must not execute"),
    };
    assert!(!plan.would_cleanup);
    assert_eq!(plan.disks.len(), 1);
    assert_eq!(plan.disks[0].size_bytes, 4 * GIB);
    assert!(plan.estimated_duration_secs > 0.0);

    assert!(cluster.files_on("t6dst").is_empty());
    assert!(cluster.vm_names_on("t6dst").is_empty());
    let mutating = cluster
        .executed_commands()
        .iter()
        .any(|(host, cmd)| host == "t6dst" && (cmd.starts_with("mkdir") || cmd.starts_with("mv")));
    assert!(!mutating);
}

#[tokio::test]
async fn test_transfer_failure_rolls_back_then_idempotent_retry() {
    let cluster = Cluster::new(&["t7src", "t7dst"]);
    cluster.add_vm(
        "t7src",
        "web01",
        &[
            (format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 2 * GIB),
            (format!("{}/web01-data.img", IMAGE_DIR).as_str(), GIB),
        ],
    );
    // Only the second disk's transfer matches this needle.
    cluster.fail_commands_containing("web01_clone_web01-data.img");
    let (cloner, _registry) = make_cloner(&cluster);

    let err = cloner
        .clone("t7src", "t7dst", "web01", CloneOptions::default())
        .await
        .expect_err("transfer failure must fail the clone");
    assert!(matches!(err, ShiftError::Transfer { .. }));
    assert_eq!(err.exit_code(), 8);

    // Rollback removed the staging directory and everything in it; no VM
    // was defined.
    assert!(cluster.files_on("t7dst").is_empty());
    assert!(cluster.vm_names_on("t7dst").is_empty());

    // Retry in idempotent mode with the fault cleared.
    cluster.clear_failures();
    let opts = CloneOptions { idempotent: true, ..Default::default() };
    let outcome = cloner.clone("t7src", "t7dst", "web01", opts).await.expect("retry succeeds");
    let result = match outcome {
        CloneOutcome::Completed(r) => r,
        CloneOutcome::Plan(_) => panic!("expected execution"),
    };
    assert!(result.success);
    assert_eq!(
        cluster.files_on("t7dst"),
        vec![
            format!("{}/web01_clone_web01-data.img", IMAGE_DIR),
            format!("{}/web01_clone_web01.qcow2", IMAGE_DIR),
        ]
    );
    assert_eq!(cluster.vm_names_on("t7dst"), vec!["web01_clone".to_string()]);

    let log = load_log(&result.operation_id).await;
    assert_eq!(log.status, TransactionStatus::Committed);
}

#[tokio::test]
async fn test_idempotent_rerun_converges() {
    let cluster = Cluster::new(&["t8src", "t8dst"]);
    cluster.add_vm("t8src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), GIB)]);
    let (cloner, _registry) = make_cloner(&cluster);

    let opts = CloneOptions { idempotent: true, ..Default::default() };
    cloner.clone("t8src", "t8dst", "web01", opts.clone()).await.expect("first clone");
    let files_after_first = cluster.files_on("t8dst");
    let vms_after_first = cluster.vm_names_on("t8dst");

    cloner.clone("t8src", "t8dst", "web01", opts).await.expect("second clone");
    assert_eq!(cluster.files_on("t8dst"), files_after_first);
    assert_eq!(cluster.vm_names_on("t8dst"), vms_after_first);

    // The second run cleaned up the first clone before re-creating it.
    let cleanup_ran = cluster
        .executed_commands()
        .iter()
        .any(|(host, cmd)| host == "t8dst" && cmd.contains("undefine"));
    assert!(cleanup_ran);
}

#[tokio::test]
async fn test_cancellation_mid_transfer() {
    let cluster = Cluster::new(&["t9src", "t9dst"]);
    cluster.add_vm("t9src", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 4 * GIB)]);
    // Long enough that the cancel lands between progress ticks.
    *cluster.stream_delay.lock().unwrap() = Duration::from_millis(60);
    let (cloner, registry) = make_cloner(&cluster);

    let clone_task = {
        let cloner = Clone::clone(&cloner);
        tokio::spawn(async move {
            cloner.clone("t9src", "t9dst", "web01", CloneOptions::default()).await
        })
    };

    // Wait until the operation is running and has reported progress, then
    // cancel it.
    let operation_id = loop {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let running = registry.list(true);
        if let Some(op) = running.first() {
            if op.status == OperationState::Running && op.progress.is_some() {
                break op.operation_id.clone();
            }
        }
    };
    assert!(registry.cancel(&operation_id));

    let err = clone_task.await.unwrap().expect_err("cancelled clone must fail");
    assert!(matches!(err, ShiftError::Cancelled { .. }));
    assert_eq!(err.exit_code(), 9);

    // Rollback removed the partial staging file; no VM was defined.
    assert!(cluster.files_on("t9dst").is_empty());
    assert!(cluster.vm_names_on("t9dst").is_empty());

    let status = registry.get(&operation_id).expect("operation retained in history");
    assert_eq!(status.status, OperationState::Cancelled);

    let log = load_log(&operation_id).await;
    assert_eq!(log.status, TransactionStatus::RolledBack);
}

#[tokio::test]
async fn test_operation_handle_progress_is_monotonic() {
    let cluster = Cluster::new(&["tasrc", "tadst"]);
    cluster.add_vm("tasrc", "web01", &[(format!("{}/web01.qcow2", IMAGE_DIR).as_str(), 2 * GIB)]);
    *cluster.stream_delay.lock().unwrap() = Duration::from_millis(10);
    let (cloner, registry) = make_cloner(&cluster);

    let clone_task = {
        let cloner = Clone::clone(&cloner);
        tokio::spawn(async move {
            cloner.clone("tasrc", "tadst", "web01", CloneOptions::default()).await
        })
    };

    let mut observed = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ops = registry.list(false);
        let Some(op) = ops.first() else { continue };
        if let Some(progress) = &op.progress {
            observed.push(progress.bytes_transferred);
        }
        if op.status.is_terminal() {
            break;
        }
    }
    clone_task.await.unwrap().expect("clone succeeds");

    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "bytes went backwards: {:?}", observed);
}
