//! `virtshift sync` command.

use super::AppContext;
use crate::output::{self, OutputMode};
use clap::Args;
use virtshift_core::error::Result;
use virtshift_core::types::{Bandwidth, SyncOptions, DEFAULT_SYNC_TIMEOUT_SECS};
use virtshift_core::Synchronizer;

/// Incrementally synchronize a VM's disks onto an existing destination VM.
#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Source host (hostname or IP)
    pub source_host: String,

    /// Destination host (hostname or IP)
    pub dest_host: String,

    /// Name of the VM to synchronize
    pub vm_name: String,

    /// Target VM name on the destination (default: same as source)
    #[arg(long)]
    pub target_name: Option<String>,

    /// Snapshot the target before syncing
    #[arg(long)]
    pub checkpoint: bool,

    /// Transfer only changed blocks (disable for a full copy)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub delta_only: bool,

    /// Bandwidth limit (e.g. "100M", "1G")
    #[arg(short, long)]
    pub bandwidth_limit: Option<String>,

    /// Operation timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Run the sync command.
pub async fn run(ctx: &AppContext, args: SyncArgs) -> Result<()> {
    let bandwidth = match &args.bandwidth_limit {
        Some(raw) => Bandwidth::parse_opt(raw)?,
        None => ctx.config.transfer.bandwidth_limit.clone(),
    };
    let opts = SyncOptions {
        target_name: args.target_name.clone(),
        checkpoint: args.checkpoint,
        delta_only: args.delta_only,
        bandwidth_limit: bandwidth,
        timeout_secs: args.timeout.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS),
    };

    let synchronizer = Synchronizer::new(
        ctx.transport.clone(),
        ctx.hypervisor.clone(),
        ctx.registry.clone(),
    );

    if !ctx.quiet && ctx.output == OutputMode::Text {
        println!(
            "Syncing VM '{}' from {} to {}...",
            args.vm_name, args.source_host, args.dest_host
        );
    }

    super::spawn_cancel_on_ctrl_c(ctx.registry.clone());
    let result =
        synchronizer.sync(&args.source_host, &args.dest_host, &args.vm_name, opts).await?;

    match ctx.output {
        OutputMode::Json => output::print_json(&result),
        OutputMode::Text => {
            if !ctx.quiet {
                println!(
                    "Synced '{}' to '{}' on {} ({}, {} blocks, {})",
                    result.vm_name,
                    result.target_vm_name,
                    result.dest_host,
                    output::format_bytes(result.bytes_transferred),
                    result.blocks_synchronized,
                    output::format_duration(result.duration)
                );
                for warning in &result.warnings {
                    println!("warning: {}", warning);
                }
            }
        }
    }
    Ok(())
}
