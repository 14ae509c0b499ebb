//! `virtshift clone` command.

use super::AppContext;
use crate::output::{self, OutputMode};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use virtshift_core::clone::{CloneOutcome, Cloner};
use virtshift_core::error::{Result, ShiftError};
use virtshift_core::types::{Bandwidth, CloneOptions, OperationState, TransferMethod};

/// Clone a virtual machine from source to destination host.
#[derive(Debug, Args)]
pub struct CloneArgs {
    /// Source host (hostname or IP)
    pub source_host: String,

    /// Destination host (hostname or IP)
    pub dest_host: String,

    /// Name of the VM to clone
    pub vm_name: String,

    /// Name for the cloned VM (default: {vm_name}_clone)
    #[arg(short, long)]
    pub new_name: Option<String>,

    /// Overwrite an existing VM on the destination
    #[arg(short, long)]
    pub force: bool,

    /// Auto-cleanup an existing target VM and retry (safe for automation)
    #[arg(long)]
    pub idempotent: bool,

    /// Show what would be done without touching the destination
    #[arg(long)]
    pub dry_run: bool,

    /// Number of parallel disk transfers (1-16)
    #[arg(short, long)]
    pub parallel: Option<u32>,

    /// Verify checksums after transfer
    #[arg(long)]
    pub verify: bool,

    /// Preserve source MAC addresses instead of generating new ones
    #[arg(long)]
    pub preserve_mac: bool,

    /// Bandwidth limit (e.g. "100M", "1G")
    #[arg(short, long)]
    pub bandwidth_limit: Option<String>,

    /// Operation timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Transfer strategy
    #[arg(long, value_parser = parse_method)]
    pub transfer_method: Option<TransferMethod>,

    /// YAML file mapping source network names to destination names
    #[arg(long)]
    pub network_config: Option<std::path::PathBuf>,
}

fn parse_method(s: &str) -> std::result::Result<TransferMethod, String> {
    TransferMethod::parse(s).ok_or_else(|| format!("must be rsync, stream or blocksync, got {}", s))
}

/// Map CLI flags onto CloneOptions, with config defaults beneath.
fn build_options(ctx: &AppContext, args: &CloneArgs) -> Result<CloneOptions> {
    let bandwidth = match &args.bandwidth_limit {
        Some(raw) => Bandwidth::parse_opt(raw)?,
        None => ctx.config.transfer.bandwidth_limit.clone(),
    };
    Ok(CloneOptions {
        new_name: args.new_name.clone(),
        force: args.force,
        dry_run: args.dry_run,
        parallel: args.parallel.unwrap_or(ctx.config.transfer.parallel),
        verify: args.verify || ctx.config.transfer.verify,
        preserve_mac: args.preserve_mac,
        bandwidth_limit: bandwidth,
        timeout_secs: args.timeout.unwrap_or(ctx.config.transfer.timeout_secs),
        idempotent: args.idempotent,
        transfer_method: args.transfer_method.unwrap_or(ctx.config.transfer.method),
        network_map: load_network_map(args.network_config.as_deref())?,
    })
}

/// Parse the optional network mapping file: a flat YAML map of source
/// network name to destination network name.
fn load_network_map(path: Option<&std::path::Path>) -> Result<Vec<(String, String)>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path).map_err(|e| ShiftError::Configuration {
        reason: format!("failed to read network config {}: {}", path.display(), e),
    })?;
    let map: std::collections::BTreeMap<String, String> = serde_yaml::from_str(&content)
        .map_err(|e| ShiftError::Configuration {
            reason: format!("invalid network config {}: {}", path.display(), e),
        })?;
    for (old, new) in &map {
        if old.is_empty() || new.is_empty() {
            return Err(ShiftError::Configuration {
                reason: format!("network config {} maps an empty name", path.display()),
            });
        }
    }
    Ok(map.into_iter().collect())
}

/// Run the clone command.
pub async fn run(ctx: &AppContext, args: CloneArgs) -> Result<()> {
    let opts = build_options(ctx, &args)?;
    let cloner = Cloner::new(
        ctx.transport.clone(),
        ctx.hypervisor.clone(),
        ctx.registry.clone(),
        ctx.config.libvirt.image_dir.clone(),
    );

    if !ctx.quiet && ctx.output == OutputMode::Text {
        println!(
            "Cloning VM '{}' from {} to {}...",
            args.vm_name, args.source_host, args.dest_host
        );
    }

    super::spawn_cancel_on_ctrl_c(ctx.registry.clone());
    let progress = spawn_progress_bar(ctx);

    let outcome = cloner.clone(&args.source_host, &args.dest_host, &args.vm_name, opts).await;
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    let outcome = outcome?;

    match outcome {
        CloneOutcome::Plan(plan) => match ctx.output {
            OutputMode::Json => output::print_json(&plan),
            OutputMode::Text => {
                println!("Dry run for '{}' -> '{}':", plan.vm_name, plan.new_vm_name);
                if plan.would_cleanup {
                    println!(
                        "  would remove existing VM '{}' on {}",
                        plan.new_vm_name, plan.dest_host
                    );
                }
                for disk in &plan.disks {
                    println!(
                        "  {} -> {} ({})",
                        disk.source_path,
                        disk.dest_path,
                        output::format_bytes(disk.size_bytes)
                    );
                }
                println!("  transfer method: {}", plan.transfer_method);
                println!(
                    "  space: {} required, {} available",
                    output::format_bytes(plan.required_bytes),
                    output::format_bytes(plan.available_bytes)
                );
                println!(
                    "  estimated duration: {}",
                    output::format_duration(plan.estimated_duration_secs)
                );
                for warning in &plan.warnings {
                    println!("  warning: {}", warning);
                }
            }
        },
        CloneOutcome::Completed(result) => match ctx.output {
            OutputMode::Json => output::print_json(&result),
            OutputMode::Text => {
                if !ctx.quiet {
                    println!(
                        "Cloned '{}' to '{}' on {} ({} in {})",
                        result.vm_name,
                        result.new_vm_name,
                        result.dest_host,
                        output::format_bytes(result.bytes_transferred),
                        output::format_duration(result.duration)
                    );
                    for warning in &result.warnings {
                        println!("warning: {}", warning);
                    }
                }
            }
        },
    }
    Ok(())
}

/// Drive an indicatif bar from the registry's progress snapshots.
fn spawn_progress_bar(ctx: &AppContext) -> Option<ProgressBar> {
    if ctx.quiet || ctx.output != OutputMode::Text {
        return None;
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let registry = ctx.registry.clone();
    let handle = bar.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let ops = registry.list(false);
            let Some(op) = ops.last() else { continue };
            if let Some(progress) = &op.progress {
                if progress.total_bytes > 0 {
                    handle.set_length(progress.total_bytes);
                    handle.set_position(progress.bytes_transferred);
                }
                if let Some(file) = &progress.current_file {
                    handle.set_message(file.rsplit('/').next().unwrap_or(file).to_string());
                }
            }
            if op.status != OperationState::Pending && op.status != OperationState::Running {
                break;
            }
        }
    });
    Some(bar)
}
