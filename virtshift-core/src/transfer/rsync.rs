//! rsync transfer strategy.
//!
//! Runs rsync on the source host, pushing directly to the destination over
//! the hosts' own SSH trust. The flag set (`-avS --partial --inplace
//! --progress`) keeps sparse regions sparse, resumes partial files in place
//! and emits per-file progress lines this module parses into byte ticks.

use super::{parse_grouped_u64, TransferSpec, TransferTick};
use crate::cancel::CancelToken;
use crate::command;
use crate::error::{Result, ShiftError};
use crate::transport::Connection;
use tokio::sync::mpsc;
use tracing::debug;

/// Run the transfer; returns bytes sent over the wire.
pub(super) async fn run(
    source: &dyn Connection,
    spec: &TransferSpec,
    progress: &mpsc::Sender<TransferTick>,
    cancel: &CancelToken,
) -> Result<u64> {
    let cmd = command::rsync(
        &spec.source_path,
        &spec.dest_path,
        Some(&spec.dest_host),
        spec.bandwidth.as_ref(),
        &[],
    )?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let dest_path = spec.dest_path.clone();
    let progress = progress.clone();

    let forwarder = tokio::spawn(async move {
        let mut last = 0u64;
        while let Some(line) = line_rx.recv().await {
            if let Some(bytes) = parse_progress_line(&line) {
                // rsync restarts its counter per file; a single-file push
                // only moves forward.
                if bytes > last {
                    last = bytes;
                    let _ = progress
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
            reason: format!("rsync exited {}: {}", output.exit_code, output.stderr.trim()),
        });
    }

    let sent = parse_sent_bytes(&output.stdout).unwrap_or(last_progress);
    debug!(sent, "rsync finished");
    Ok(sent)
}

/// Parse a `--progress` line such as
/// `  1,234,567  45%  1.20MB/s  0:00:12` into its byte counter.
fn parse_progress_line(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let bytes = parse_grouped_u64(first)?;
    // Require the percent column so file names made of digits don't parse
    // as progress.
    let second = tokens.next()?;
    if !second.ends_with('%') {
        return None;
    }
    Some(bytes)
}

/// Parse rsync's final `sent 4,096,123 bytes  received 35 bytes …` summary.
fn parse_sent_bytes(output: &str) -> Option<u64> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("sent ") {
            let token = rest.split_whitespace().next()?;
            return parse_grouped_u64(token);
        }
    }
    None
}
