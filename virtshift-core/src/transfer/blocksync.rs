//! blocksync transfer strategy.
//!
//! Refreshes an existing destination file by hashing fixed-size blocks on
//! both ends and transferring only the blocks that differ. Requires the
//! `blocksync` tool on both hosts. A first transfer with no destination
//! file falls back to a full rsync copy.

use super::{parse_grouped_u64, remote_file_exists, rsync, TransferSpec, TransferTick};
use crate::cancel::CancelToken;
use crate::command;
use crate::error::{Result, ShiftError};
use crate::transport::Connection;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Block size used for differential hashing (1 MiB).
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Run the transfer; returns bytes actually moved.
pub(super) async fn run(
    source: &dyn Connection,
    dest: &dyn Connection,
    spec: &TransferSpec,
    progress: &mpsc::Sender<TransferTick>,
    cancel: &CancelToken,
) -> Result<u64> {
    ensure_tool(source, &spec.source_host).await?;
    ensure_tool(dest, &spec.dest_host).await?;

    if !remote_file_exists(dest, &spec.dest_path).await? {
        info!(dst = %spec.dest_path, "No destination file yet, falling back to full copy");
        return rsync::run(source, spec, progress, cancel).await;
    }

    let cmd = command::blocksync(
        &spec.source_path,
        &spec.dest_host,
        &spec.dest_path,
        BLOCK_SIZE,
        spec.bandwidth.as_ref(),
    )?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let dest_path = spec.dest_path.clone();
    let progress_tx = progress.clone();

    let forwarder = tokio::spawn(async move {
        let mut last = 0u64;
        while let Some(line) = line_rx.recv().await {
            if let Some(bytes) = parse_bytes_line(&line) {
                if bytes > last {
                    last = bytes;
                    let _ = progress_tx
                        .send(TransferTick { dest_path: dest_path.clone(), bytes })
                        .await;
                }
            }
        }
        last
    });

    let output = source.execute_streamed(&cmd, line_tx, cancel.clone()).await;
    let last_progress = forwarder.await.unwrap_or(0);
    let output = output?;

    if !output.success() {
        return Err(ShiftError::Transfer {
            src_host: spec.source_host.clone(),
            dest: spec.dest_host.clone(),
            reason: format!("blocksync exited {}: {}", output.exit_code, output.stderr.trim()),
        });
    }

    debug!(bytes = last_progress, "blocksync finished");
    Ok(last_progress)
}

/// Fail with a clear diagnostic when the tool is missing on a host.
async fn ensure_tool(conn: &dyn Connection, host: &str) -> Result<()> {
    let probe = command::which("blocksync")?;
    if !conn.execute(&probe, None).await?.success() {
        return Err(ShiftError::Transfer {
            src_host: host.to_string(),
            dest: host.to_string(),
            reason: format!(
                "the blocksync tool is not installed on {}; install it on both hosts or use --transfer-method rsync",
                host
            ),
        });
    }
    Ok(())
}

/// Parse a `… <N> bytes …` progress line.
fn parse_bytes_line(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if tokens.peek().is_some_and(|next| next.starts_with("bytes")) {
            if let Some(bytes) = parse_grouped_u64(token) {
                return Some(bytes);
            }
        }
    }
    None
}
