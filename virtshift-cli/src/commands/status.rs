//! `virtshift status` command.
//!
//! Live operations exist only in the owning process; finished ones leave a
//! transaction log behind. The command reads the in-process registry first
//! and falls back to the on-disk logs.

use super::AppContext;
use crate::output::{self, OutputMode};
use clap::Args;
use std::time::Duration;
use virtshift_core::error::{Result, ShiftError};
use virtshift_core::paths;
use virtshift_core::transaction::{TransactionLog, TransactionStatus};
use virtshift_core::types::{OperationState, OperationStatus};

/// Show the status of operations.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Operation id to inspect
    pub operation_id: Option<String>,

    /// Show all known operations
    #[arg(long)]
    pub all: bool,

    /// Show only operations active in this process
    #[arg(long)]
    pub active: bool,

    /// Poll a live operation until it finishes
    #[arg(long)]
    pub follow: bool,
}

/// Run the status command.
pub async fn run(ctx: &AppContext, args: StatusArgs) -> Result<()> {
    if args.active {
        let active = ctx.registry.list(true);
        render_many(ctx, &active);
        return Ok(());
    }

    if args.all || args.operation_id.is_none() {
        let mut statuses = ctx.registry.list(false);
        statuses.extend(from_logs(&statuses).await?);
        render_many(ctx, &statuses);
        return Ok(());
    }

    let operation_id = args.operation_id.as_deref().expect("checked above");

    if args.follow {
        loop {
            match ctx.registry.get(operation_id) {
                Some(status) => {
                    render_one(ctx, &status);
                    if status.status.is_terminal() {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => break,
            }
        }
    }

    let status = match ctx.registry.get(operation_id) {
        Some(status) => status,
        None => {
            let log_path = paths::transaction_log_path(operation_id);
            if !log_path.exists() {
                return Err(ShiftError::OperationNotFound {
                    operation_id: operation_id.to_string(),
                });
            }
            status_from_log(&TransactionLog::load(&log_path).await?)
        }
    };
    render_one(ctx, &status);
    Ok(())
}

/// Build statuses for finished operations only known from their logs.
async fn from_logs(known: &[OperationStatus]) -> Result<Vec<OperationStatus>> {
    let dir = paths::transactions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| ShiftError::Io { path: dir.clone(), source: e })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ShiftError::Io { path: dir.clone(), source: e })?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(log) = TransactionLog::load(&path).await else {
            continue;
        };
        if known.iter().any(|s| s.operation_id == log.transaction_id) {
            continue;
        }
        out.push(status_from_log(&log));
    }
    Ok(out)
}

/// Derive an operation status from a transaction's terminal state.
fn status_from_log(log: &TransactionLog) -> OperationStatus {
    let state = match log.status {
        TransactionStatus::Committed => OperationState::Completed,
        TransactionStatus::RolledBack => {
            if log.error.is_some() {
                OperationState::Failed
            } else {
                OperationState::Cancelled
            }
        }
        TransactionStatus::Active | TransactionStatus::RollingBack => OperationState::Running,
    };
    OperationStatus {
        operation_id: log.transaction_id.clone(),
        operation_type: log.operation_type,
        status: state,
        progress: None,
        created: log.started_at,
        started: Some(log.started_at),
        completed: log.completed_at,
        error: log.error.clone(),
        result: None,
    }
}

fn render_many(ctx: &AppContext, statuses: &[OperationStatus]) {
    match ctx.output {
        OutputMode::Json => output::print_json(&statuses),
        OutputMode::Text => {
            if statuses.is_empty() {
                println!("No operations");
                return;
            }
            for status in statuses {
                print_line(status);
            }
        }
    }
}

fn render_one(ctx: &AppContext, status: &OperationStatus) {
    match ctx.output {
        OutputMode::Json => output::print_json(status),
        OutputMode::Text => print_line(status),
    }
}

fn print_line(status: &OperationStatus) {
    let mut line = format!(
        "{}  {}  {}",
        status.operation_id, status.operation_type, status.status
    );
    if let Some(progress) = &status.progress {
        line.push_str(&format!(
            "  {:.1}% ({}/{})",
            progress.percent(),
            output::format_bytes(progress.bytes_transferred),
            output::format_bytes(progress.total_bytes)
        ));
    }
    if let Some(error) = &status.error {
        line.push_str(&format!("  error: {}", error));
    }
    println!("{}", line);
}
