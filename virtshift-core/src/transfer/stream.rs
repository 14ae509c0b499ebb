//! Stream transfer strategy.
//!
//! A one-shot scp push from the source host. No resume and no incremental
//! progress; appropriate for fast, stable networks. Bandwidth limits apply
//! at the cipher level through scp's `-l` option.

use super::{remote_file_size, TransferSpec, TransferTick};
use crate::cancel::CancelToken;
use crate::command;
use crate::error::{Result, ShiftError};
use crate::transport::Connection;
use tokio::sync::mpsc;

/// Run the transfer; returns the destination file size.
pub(super) async fn run(
    source: &dyn Connection,
    dest: &dyn Connection,
    spec: &TransferSpec,
    progress: &mpsc::Sender<TransferTick>,
    cancel: &CancelToken,
) -> Result<u64> {
    let cmd =
        command::scp(&spec.source_path, &spec.dest_host, &spec.dest_path, None, spec.bandwidth.as_ref())?;

    // scp prints no machine-readable progress when not attached to a tty;
    // the discard channel still lets cancellation kill the copy.
    let (discard_tx, mut discard_rx) = mpsc::channel::<String>(8);
    let drain = tokio::spawn(async move { while discard_rx.recv().await.is_some() {} });

    let output = source.execute_streamed(&cmd, discard_tx, cancel.clone()).await;
    let _ = drain.await;
    let output = output?;

    if !output.success() {
        return Err(ShiftError::Transfer {
            src_host: spec.source_host.clone(),
            dest: spec.dest_host.clone(),
            reason: format!("scp exited {}: {}", output.exit_code, output.stderr.trim()),
        });
    }

    let bytes = remote_file_size(dest, &spec.dest_path).await?;
    let _ = progress.send(TransferTick { dest_path: spec.dest_path.clone(), bytes }).await;
    Ok(bytes)
}
