//! Transaction manager integration tests: commit conversion, LIFO
//! rollback ordering, and replaying a rollback from the on-disk log.

mod support;

use std::sync::Arc;
use support::{Cluster, FileEntry, MockTransport};
use virtshift_core::hypervisor::Hypervisor;
use virtshift_core::paths;
use virtshift_core::transaction::{
    ResourceKind, Transaction, TransactionLog, TransactionStatus,
};
use virtshift_core::types::OperationKind;

fn setup(hosts: &[&str]) -> (Arc<Cluster>, Arc<MockTransport>) {
    support::init_state_dir();
    let cluster = Cluster::new(hosts);
    let transport = MockTransport::new(cluster.clone());
    (cluster, transport)
}

fn put_file(cluster: &Cluster, host: &str, path: &str, size: u64) {
    cluster.with_host(host, |s| {
        s.files.insert(path.to_string(), FileEntry { size, content: path.to_string() });
    });
}

#[tokio::test]
async fn test_commit_moves_staged_files() {
    let (cluster, transport) = setup(&["txh1"]);
    put_file(&cluster, "txh1", "/var/lib/libvirt/images/.stage/a.qcow2", 1024);
    cluster.with_host("txh1", |s| {
        s.dirs.insert("/var/lib/libvirt/images/.stage".to_string());
    });

    let mut txn = Transaction::begin(
        "txn-commit-1",
        OperationKind::Clone,
        transport.clone(),
        Hypervisor::new("qemu:///system"),
    )
    .await
    .unwrap();

    txn.register_staging_dir("/var/lib/libvirt/images/.stage", "txh1").await.unwrap();
    txn.register_temp_disk(
        "/var/lib/libvirt/images/.stage/a.qcow2",
        "txh1",
        "/var/lib/libvirt/images/a.qcow2",
    )
    .await
    .unwrap();

    txn.commit(None).await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::Committed);

    // The staged file moved to its final path and staging is gone.
    assert_eq!(cluster.files_on("txh1"), vec!["/var/lib/libvirt/images/a.qcow2".to_string()]);

    // The record converted to a final disk file in the persisted log.
    let log = TransactionLog::load(&paths::transaction_log_path("txn-commit-1")).await.unwrap();
    assert_eq!(log.status, TransactionStatus::Committed);
    let final_disk = log
        .records
        .iter()
        .find(|r| r.kind == ResourceKind::FinalDiskFile)
        .expect("temp disk became final");
    assert_eq!(final_disk.id, "/var/lib/libvirt/images/a.qcow2");
}

#[tokio::test]
async fn test_rollback_is_reverse_order() {
    let (cluster, transport) = setup(&["txh2"]);
    put_file(&cluster, "txh2", "/var/lib/libvirt/images/.stage/a.qcow2", 1024);
    cluster.add_vm("txh2", "ghost", &[("/var/lib/libvirt/images/ghost.qcow2", 512)]);

    let mut txn = Transaction::begin(
        "txn-rollback-1",
        OperationKind::Clone,
        transport.clone(),
        Hypervisor::new("qemu:///system"),
    )
    .await
    .unwrap();

    txn.register_staging_dir("/var/lib/libvirt/images/.stage", "txh2").await.unwrap();
    txn.register_temp_disk(
        "/var/lib/libvirt/images/.stage/a.qcow2",
        "txh2",
        "/var/lib/libvirt/images/a.qcow2",
    )
    .await
    .unwrap();
    txn.register_vm("ghost", "txh2").await.unwrap();

    let before = cluster.executed_commands().len();
    txn.rollback().await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::RolledBack);

    // Undo ran newest-first: VM, then temp file, then staging dir.
    let undo: Vec<String> = cluster.executed_commands()[before..]
        .iter()
        .map(|(_, cmd)| cmd.clone())
        .collect();
    let vm_pos = undo.iter().position(|c| c.contains("undefine")).expect("vm undone");
    let file_pos = undo.iter().position(|c| c.starts_with("rm -f ")).expect("file undone");
    let dir_pos = undo.iter().position(|c| c.starts_with("rm -rf ")).expect("dir undone");
    assert!(vm_pos < file_pos, "vm before file: {:?}", undo);
    assert!(file_pos < dir_pos, "file before dir: {:?}", undo);

    // Everything is gone.
    assert!(cluster.vm_names_on("txh2").is_empty());
    assert_eq!(
        cluster.files_on("txh2"),
        // The ghost VM's own disk is not a recorded resource.
        vec!["/var/lib/libvirt/images/ghost.qcow2".to_string()]
    );
}

#[tokio::test]
async fn test_rollback_continues_past_failures() {
    let (cluster, transport) = setup(&["txh3"]);
    put_file(&cluster, "txh3", "/var/lib/libvirt/images/.stage/a.qcow2", 1024);

    let mut txn = Transaction::begin(
        "txn-rollback-2",
        OperationKind::Clone,
        transport.clone(),
        Hypervisor::new("qemu:///system"),
    )
    .await
    .unwrap();

    txn.register_staging_dir("/var/lib/libvirt/images/.stage", "txh3").await.unwrap();
    // This undo command fails; later undos must still run.
    txn.register_custom("marker", "txh3", "false").await.unwrap();

    txn.rollback().await.unwrap();
    assert_eq!(txn.status(), TransactionStatus::RolledBack);

    // The staging dir undo still ran despite the earlier failure.
    assert!(cluster
        .executed_commands()
        .iter()
        .any(|(_, cmd)| cmd.starts_with("rm -rf ")));
}

#[tokio::test]
async fn test_replay_rollback_from_disk() {
    let (cluster, transport) = setup(&["txh4"]);
    put_file(&cluster, "txh4", "/var/lib/libvirt/images/.stage/a.qcow2", 1024);
    cluster.add_vm("txh4", "replayed", &[("/var/lib/libvirt/images/replayed.qcow2", 512)]);

    // Simulate a crash: the transaction registers resources and never
    // reaches a terminal state.
    {
        let mut txn = Transaction::begin(
            "txn-replay-1",
            OperationKind::Clone,
            transport.clone(),
            Hypervisor::new("qemu:///system"),
        )
        .await
        .unwrap();
        txn.register_staging_dir("/var/lib/libvirt/images/.stage", "txh4").await.unwrap();
        txn.register_temp_disk(
            "/var/lib/libvirt/images/.stage/a.qcow2",
            "txh4",
            "/var/lib/libvirt/images/a.qcow2",
        )
        .await
        .unwrap();
        txn.register_vm("replayed", "txh4").await.unwrap();
        // Dropped here without commit or rollback.
    }

    let log = TransactionLog::load(&paths::transaction_log_path("txn-replay-1")).await.unwrap();
    assert_eq!(log.status, TransactionStatus::Active);
    assert_eq!(log.records.len(), 3);

    Transaction::replay_rollback(log, transport.clone(), Hypervisor::new("qemu:///system"))
        .await
        .unwrap();

    // Same outcome as a live rollback.
    assert!(cluster.vm_names_on("txh4").is_empty());
    assert!(!cluster
        .files_on("txh4")
        .contains(&"/var/lib/libvirt/images/.stage/a.qcow2".to_string()));

    let replayed = TransactionLog::load(&paths::transaction_log_path("txn-replay-1")).await.unwrap();
    assert_eq!(replayed.status, TransactionStatus::RolledBack);
}

#[tokio::test]
async fn test_replay_refuses_committed_log() {
    let (_cluster, transport) = setup(&["txh5"]);

    let mut txn = Transaction::begin(
        "txn-replay-2",
        OperationKind::Clone,
        transport.clone(),
        Hypervisor::new("qemu:///system"),
    )
    .await
    .unwrap();
    txn.commit(None).await.unwrap();

    let log = TransactionLog::load(&paths::transaction_log_path("txn-replay-2")).await.unwrap();
    let result =
        Transaction::replay_rollback(log, transport, Hypervisor::new("qemu:///system")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_terminal_transaction_rejects_records() {
    let (_cluster, transport) = setup(&["txh6"]);

    let mut txn = Transaction::begin(
        "txn-frozen-1",
        OperationKind::Clone,
        transport.clone(),
        Hypervisor::new("qemu:///system"),
    )
    .await
    .unwrap();
    txn.commit(None).await.unwrap();

    assert!(txn.register_vm("late", "txh6").await.is_err());
    assert!(txn.commit(None).await.is_err());
}
