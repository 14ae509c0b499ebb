//! Transaction management for atomic clone and sync operations.
//!
//! Every side effect on the destination host is recorded here together with
//! its undo action. Commit finalizes staged files into place; rollback
//! undoes every record in strict reverse order, best effort. Each state
//! transition and record insertion is persisted to a JSON audit log so an
//! interrupted rollback can be replayed from disk.

use crate::command;
use crate::error::{Result, ShiftError};
use crate::hypervisor::Hypervisor;
use crate::paths;
use crate::transport::Transport;
use crate::types::OperationKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Kind of a recorded resource, which determines its commit and rollback
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Empty directory holding in-flight files; removed on both outcomes
    StagingDirectory,
    /// File inside the staging directory; moved to `final_path` on commit,
    /// unlinked on rollback
    TempDiskFile,
    /// File already at its final path; kept on commit, unlinked on rollback
    FinalDiskFile,
    /// Defined VM; kept on commit, destroyed and undefined on rollback
    VmDefinition,
    /// Arbitrary undo command executed only on rollback
    Custom,
}

impl ResourceKind {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StagingDirectory => "staging-directory",
            Self::TempDiskFile => "temporary-disk-file",
            Self::FinalDiskFile => "final-disk-file",
            Self::VmDefinition => "vm-definition",
            Self::Custom => "custom",
        }
    }
}

/// One recorded side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    /// Path or VM name
    pub id: String,
    /// Host the resource lives on
    pub host: String,
    /// For temporary disk files: where commit moves them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_path: Option<String>,
    /// For custom records: the undo command to run on rollback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undo_command: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
        }
    }

    /// Whether the transaction has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk audit log of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLog {
    pub transaction_id: String,
    pub operation_type: OperationKind,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub records: Vec<ResourceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransactionLog {
    /// Load an audit log from disk.
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ShiftError::Io { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content).map_err(|e| ShiftError::General(format!(
            "corrupt transaction log {}: {}",
            path.display(),
            e
        )))
    }
}

/// A transactional recording of destination-host side effects, owned
/// exclusively by one orchestrator invocation.
pub struct Transaction {
    transport: Arc<dyn Transport>,
    hypervisor: Hypervisor,
    log: TransactionLog,
    log_path: PathBuf,
}

impl Transaction {
    /// Open a transaction and persist its initial (active) log entry.
    pub async fn begin(
        operation_id: &str,
        kind: OperationKind,
        transport: Arc<dyn Transport>,
        hypervisor: Hypervisor,
    ) -> Result<Self> {
        let log = TransactionLog {
            transaction_id: operation_id.to_string(),
            operation_type: kind,
            started_at: Utc::now(),
            completed_at: None,
            status: TransactionStatus::Active,
            records: Vec::new(),
            error: None,
        };
        let txn = Self {
            transport,
            hypervisor,
            log,
            log_path: paths::transaction_log_path(operation_id),
        };
        txn.persist().await?;
        info!(transaction_id = operation_id, "Transaction started");
        Ok(txn)
    }

    /// Transaction identifier.
    pub fn id(&self) -> &str {
        &self.log.transaction_id
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.log.status
    }

    /// Recorded resources, in insertion order.
    pub fn records(&self) -> &[ResourceRecord] {
        &self.log.records
    }

    /// Record the error that caused this transaction to fail, for the
    /// audit log.
    pub fn set_error(&mut self, error: &ShiftError) {
        self.log.error = Some(error.to_string());
    }

    /// Append a record and persist the log.
    async fn register(&mut self, record: ResourceRecord) -> Result<()> {
        if self.log.status != TransactionStatus::Active {
            return Err(ShiftError::General(format!(
                "transaction {} is {} and cannot accept records",
                self.log.transaction_id, self.log.status
            )));
        }
        debug!(
            transaction_id = %self.log.transaction_id,
            kind = record.kind.as_str(),
            id = %record.id,
            host = %record.host,
            "Registered resource"
        );
        self.log.records.push(record);
        self.persist().await
    }

    /// Record the staging directory.
    pub async fn register_staging_dir(&mut self, path: &str, host: &str) -> Result<()> {
        self.register(ResourceRecord {
            kind: ResourceKind::StagingDirectory,
            id: path.to_string(),
            host: host.to_string(),
            final_path: None,
            undo_command: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Record a staged disk file and the final path commit will move it to.
    pub async fn register_temp_disk(
        &mut self,
        path: &str,
        host: &str,
        final_path: &str,
    ) -> Result<()> {
        self.register(ResourceRecord {
            kind: ResourceKind::TempDiskFile,
            id: path.to_string(),
            host: host.to_string(),
            final_path: Some(final_path.to_string()),
            undo_command: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Record a file already at its final location.
    pub async fn register_final_disk(&mut self, path: &str, host: &str) -> Result<()> {
        self.register(ResourceRecord {
            kind: ResourceKind::FinalDiskFile,
            id: path.to_string(),
            host: host.to_string(),
            final_path: None,
            undo_command: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Record a defined VM.
    pub async fn register_vm(&mut self, name: &str, host: &str) -> Result<()> {
        self.register(ResourceRecord {
            kind: ResourceKind::VmDefinition,
            id: name.to_string(),
            host: host.to_string(),
            final_path: None,
            undo_command: None,
            created_at: Utc::now(),
        })
        .await
    }

    /// Record an arbitrary undo command.
    pub async fn register_custom(&mut self, id: &str, host: &str, undo_command: &str) -> Result<()> {
        self.register(ResourceRecord {
            kind: ResourceKind::Custom,
            id: id.to_string(),
            host: host.to_string(),
            final_path: None,
            undo_command: Some(undo_command.to_string()),
            created_at: Utc::now(),
        })
        .await
    }

    /// Commit: move every staged file to its final path (sequentially, in
    /// insertion order), then remove staging directories. A failed move
    /// aborts the commit and rolls everything back; files that already
    /// moved are converted to final-disk-file records first so rollback
    /// removes them too. Cancellation is honored between moves, after the
    /// in-flight move completes.
    #[instrument(skip(self, cancel), fields(transaction_id = %self.log.transaction_id))]
    pub async fn commit(&mut self, cancel: Option<&crate::cancel::CancelToken>) -> Result<()> {
        if self.log.status != TransactionStatus::Active {
            return Err(ShiftError::General(format!(
                "transaction {} is {} and cannot commit",
                self.log.transaction_id, self.log.status
            )));
        }

        info!(records = self.log.records.len(), "Committing transaction");

        for idx in 0..self.log.records.len() {
            if let Some(token) = cancel {
                if let Err(e) = token.check(&self.log.transaction_id) {
                    self.set_error(&e);
                    self.rollback().await?;
                    return Err(e);
                }
            }

            let record = self.log.records[idx].clone();
            if record.kind != ResourceKind::TempDiskFile {
                continue;
            }
            let Some(final_path) = record.final_path.clone() else {
                continue;
            };

            if let Err(e) = self.move_file(&record.host, &record.id, &final_path).await {
                error!(
                    src = %record.id,
                    dst = %final_path,
                    error = %e,
                    "Commit move failed, rolling back"
                );
                self.set_error(&e);
                self.rollback().await?;
                return Err(e);
            }

            let moved = &mut self.log.records[idx];
            moved.kind = ResourceKind::FinalDiskFile;
            moved.id = final_path;
            moved.final_path = None;
            self.persist().await?;
        }

        for record in self.log.records.clone() {
            if record.kind == ResourceKind::StagingDirectory {
                if let Err(e) = self.remove_directory(&record.host, &record.id).await {
                    warn!(path = %record.id, error = %e, "Failed to remove staging directory");
                }
            }
        }

        self.log.status = TransactionStatus::Committed;
        self.log.completed_at = Some(Utc::now());
        self.persist().await?;
        info!("Transaction committed");
        Ok(())
    }

    /// Roll back: undo every record in strict reverse order. Best effort;
    /// failures are logged and the remaining undos still run.
    #[instrument(skip(self), fields(transaction_id = %self.log.transaction_id))]
    pub async fn rollback(&mut self) -> Result<()> {
        if self.log.status.is_terminal() {
            warn!("Transaction already {}", self.log.status);
            return Ok(());
        }

        self.log.status = TransactionStatus::RollingBack;
        self.persist().await?;
        info!(records = self.log.records.len(), "Rolling back transaction");

        for record in self.log.records.clone().iter().rev() {
            if let Err(e) = undo_record(self.transport.as_ref(), &self.hypervisor, record).await {
                error!(
                    kind = record.kind.as_str(),
                    id = %record.id,
                    host = %record.host,
                    error = %e,
                    "Rollback step failed; manual inspection may be needed"
                );
            } else {
                debug!(kind = record.kind.as_str(), id = %record.id, "Rolled back resource");
            }
        }

        self.log.status = TransactionStatus::RolledBack;
        self.log.completed_at = Some(Utc::now());
        self.persist().await?;
        info!("Transaction rolled back");
        Ok(())
    }

    /// Replay the rollback plan of an on-disk audit log. Used to recover a
    /// transaction that died before reaching a terminal state.
    pub async fn replay_rollback(
        log: TransactionLog,
        transport: Arc<dyn Transport>,
        hypervisor: Hypervisor,
    ) -> Result<()> {
        let mut txn = Self {
            transport,
            hypervisor,
            log_path: paths::transaction_log_path(&log.transaction_id),
            log,
        };
        if txn.log.status == TransactionStatus::Committed {
            return Err(ShiftError::General(format!(
                "transaction {} is committed; refusing to roll back",
                txn.log.transaction_id
            )));
        }
        // A log frozen mid-rollback restarts the whole plan; undos are
        // idempotent.
        txn.log.status = TransactionStatus::Active;
        txn.rollback().await
    }

    async fn move_file(&self, host: &str, src: &str, dst: &str) -> Result<()> {
        let conn = self.transport.connect(host).await?;
        let cmd = command::move_file(src, dst)?;
        let output = conn.execute(&cmd, None).await?;
        if !output.success() {
            return Err(ShiftError::General(format!(
                "mv {} -> {} on {} failed: {}",
                src,
                dst,
                host,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove_directory(&self, host: &str, path: &str) -> Result<()> {
        let conn = self.transport.connect(host).await?;
        let cmd = command::rm_directory(path)?;
        let output = conn.execute(&cmd, None).await?;
        if !output.success() {
            return Err(ShiftError::General(format!(
                "rm -rf {} on {} failed: {}",
                path,
                host,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Atomically write the audit log (temp file + rename).
    async fn persist(&self) -> Result<()> {
        let dir = self.log_path.parent().expect("log path has a parent");
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ShiftError::Io { path: dir.to_path_buf(), source: e })?;

        let content = serde_json::to_string_pretty(&self.log)
            .map_err(|e| ShiftError::General(format!("failed to serialize transaction log: {}", e)))?;

        let tmp = self.log_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| ShiftError::Io { path: tmp.clone(), source: e })?;
        tokio::fs::rename(&tmp, &self.log_path)
            .await
            .map_err(|e| ShiftError::Io { path: self.log_path.clone(), source: e })?;
        Ok(())
    }
}

/// Execute the undo action for one record.
async fn undo_record(
    transport: &dyn Transport,
    hypervisor: &Hypervisor,
    record: &ResourceRecord,
) -> Result<()> {
    let conn = transport.connect(&record.host).await?;
    match record.kind {
        ResourceKind::TempDiskFile | ResourceKind::FinalDiskFile => {
            let cmd = command::rm_file(&record.id)?;
            let output = conn.execute(&cmd, None).await?;
            if !output.success() {
                return Err(ShiftError::General(output.stderr.trim().to_string()));
            }
            Ok(())
        }
        ResourceKind::StagingDirectory => {
            let cmd = command::rm_directory(&record.id)?;
            let output = conn.execute(&cmd, None).await?;
            if !output.success() {
                return Err(ShiftError::General(output.stderr.trim().to_string()));
            }
            Ok(())
        }
        ResourceKind::VmDefinition => {
            // Disks are covered by their own records; only the definition
            // is undone here. A VM that never started makes destroy fail,
            // which is expected.
            hypervisor.cleanup_definition(conn.as_ref(), &record.id).await
        }
        ResourceKind::Custom => match &record.undo_command {
            Some(cmd) => {
                let output = conn.execute(cmd, None).await?;
                if !output.success() {
                    return Err(ShiftError::General(output.stderr.trim().to_string()));
                }
                Ok(())
            }
            None => Ok(()),
        },
    }
}
