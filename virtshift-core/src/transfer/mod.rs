//! Disk image transfer engine.
//!
//! Moves a single disk image between two remote hosts using one of three
//! strategies: rsync (default; resumable, sparse-aware), stream (one-shot
//! scp) or blocksync (block-level differential refresh of an existing
//! destination file). All strategies share one contract: they stream
//! cumulative byte counts to a progress sink, stop at the next progress
//! boundary on cancellation, and optionally verify a SHA-256 digest of both
//! ends after the copy.

mod blocksync;
mod rsync;
mod stream;

use crate::cancel::CancelToken;
use crate::command;
use crate::error::{Result, ShiftError};
use crate::transport::Connection;
use crate::types::{Bandwidth, TransferMethod};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

/// One disk transfer request.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub source_host: String,
    pub source_path: String,
    pub dest_host: String,
    pub dest_path: String,
    pub bandwidth: Option<Bandwidth>,
    pub verify: bool,
}

/// Cumulative progress for one file.
#[derive(Debug, Clone)]
pub struct TransferTick {
    pub dest_path: String,
    pub bytes: u64,
}

/// Result of one completed transfer.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Bytes actually moved over the wire (sparse regions excluded where
    /// the strategy supports them)
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// SHA-256 of the destination file, when verification ran
    pub checksum: Option<String>,
}

/// Run one disk transfer with the selected strategy.
///
/// `source` must be a connection to the host holding the image; `dest` is
/// used for existence checks, verification and blocksync tool probing.
#[instrument(skip_all, fields(method = %method, src = %spec.source_path, dst = %spec.dest_path))]
pub async fn run(
    method: TransferMethod,
    source: &dyn Connection,
    dest: &dyn Connection,
    spec: &TransferSpec,
    progress: mpsc::Sender<TransferTick>,
    cancel: CancelToken,
) -> Result<TransferOutcome> {
    cancel_guard(&cancel)?;
    let started = Instant::now();

    let bytes_transferred = match method {
        TransferMethod::Rsync => rsync::run(source, spec, &progress, &cancel).await?,
        TransferMethod::Stream => stream::run(source, dest, spec, &progress, &cancel).await?,
        TransferMethod::Blocksync => blocksync::run(source, dest, spec, &progress, &cancel).await?,
    };

    let checksum = if spec.verify {
        cancel_guard(&cancel)?;
        Some(verify_checksums(source, dest, spec).await?)
    } else {
        None
    };

    let duration = started.elapsed();
    info!(
        bytes = bytes_transferred,
        secs = duration.as_secs(),
        verified = checksum.is_some(),
        "Transfer complete"
    );

    Ok(TransferOutcome { bytes_transferred, duration, checksum })
}

/// Compute SHA-256 on both ends and fail on mismatch. Returns the digest.
async fn verify_checksums(
    source: &dyn Connection,
    dest: &dyn Connection,
    spec: &TransferSpec,
) -> Result<String> {
    debug!(src = %spec.source_path, dst = %spec.dest_path, "Verifying checksums");

    let src_cmd = command::sha256sum(&spec.source_path)?;
    let dst_cmd = command::sha256sum(&spec.dest_path)?;

    let (src_out, dst_out) =
        tokio::join!(source.execute(&src_cmd, None), dest.execute(&dst_cmd, None));
    let src_out = src_out?;
    let dst_out = dst_out?;

    if !src_out.success() || !dst_out.success() {
        return Err(ShiftError::Transfer {
            src_host: spec.source_host.clone(),
            dest: spec.dest_host.clone(),
            reason: format!(
                "checksum command failed: {} {}",
                src_out.stderr.trim(),
                dst_out.stderr.trim()
            ),
        });
    }

    let src_sum = src_out.stdout.trim().to_string();
    let dst_sum = dst_out.stdout.trim().to_string();
    if src_sum.is_empty() || src_sum != dst_sum {
        return Err(ShiftError::Transfer {
            src_host: spec.source_host.clone(),
            dest: spec.dest_host.clone(),
            reason: format!(
                "checksum mismatch for {}: source {} != dest {}",
                spec.dest_path, src_sum, dst_sum
            ),
        });
    }

    Ok(dst_sum)
}

/// Map a pending cancellation to the canonical error.
fn cancel_guard(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ShiftError::Cancelled { operation_id: String::new() });
    }
    Ok(())
}

/// Parse a decimal byte count that may use comma grouping ("1,234,567").
pub(crate) fn parse_grouped_u64(token: &str) -> Option<u64> {
    let cleaned: String = token.chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

/// Size of a remote file in bytes, zero when it cannot be read.
pub(crate) async fn remote_file_size(conn: &dyn Connection, path: &str) -> Result<u64> {
    let cmd = command::stat_size(path)?;
    let output = conn.execute(&cmd, None).await?;
    if !output.success() {
        return Ok(0);
    }
    Ok(output.stdout.trim().parse().unwrap_or(0))
}

/// Whether a remote regular file exists.
pub(crate) async fn remote_file_exists(conn: &dyn Connection, path: &str) -> Result<bool> {
    let cmd = command::file_exists(path)?;
    Ok(conn.execute(&cmd, None).await?.success())
}
