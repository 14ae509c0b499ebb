//! `virtshift list` command.

use super::AppContext;
use crate::output;
use clap::Args;
use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};
use tracing::error;
use virtshift_core::error::Result;
use virtshift_core::types::{VmDescriptor, VmRunState};

/// List VMs on one or more hosts.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Hosts to query
    #[arg(required = true)]
    pub hosts: Vec<String>,

    /// Filter by VM status
    #[arg(long, value_parser = parse_filter, default_value = "all")]
    pub status: StatusFilter,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    pub format: ListFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    Running,
    Stopped,
    Paused,
}

impl StatusFilter {
    fn as_state(self) -> Option<VmRunState> {
        match self {
            Self::All => None,
            Self::Running => Some(VmRunState::Running),
            Self::Stopped => Some(VmRunState::Stopped),
            Self::Paused => Some(VmRunState::Paused),
        }
    }
}

fn parse_filter(s: &str) -> std::result::Result<StatusFilter, String> {
    match s.to_lowercase().as_str() {
        "all" => Ok(StatusFilter::All),
        "running" => Ok(StatusFilter::Running),
        "stopped" => Ok(StatusFilter::Stopped),
        "paused" => Ok(StatusFilter::Paused),
        other => Err(format!("must be all, running, stopped or paused, got {}", other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListFormat {
    Table,
    List,
    Json,
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "VCPUS")]
    vcpus: u32,
    #[tabled(rename = "DISKS")]
    disks: String,
}

/// Run the list command. A host that fails to answer yields an empty list
/// and an error log rather than aborting the whole listing.
pub async fn run(ctx: &AppContext, args: ListArgs) -> Result<()> {
    let mut by_host: BTreeMap<String, Vec<VmDescriptor>> = BTreeMap::new();

    for host in &args.hosts {
        let vms = match ctx.transport.connect(host).await {
            Ok(conn) => match ctx.hypervisor.list_vms(conn.as_ref(), args.status.as_state()).await
            {
                Ok(vms) => vms,
                Err(e) => {
                    error!(host = %host, error = %e, "Failed to list VMs");
                    Vec::new()
                }
            },
            Err(e) => {
                error!(host = %host, error = %e, "Failed to connect");
                Vec::new()
            }
        };
        by_host.insert(host.clone(), vms);
    }

    match args.format {
        ListFormat::Json => output::print_json(&by_host),
        ListFormat::List => {
            for (host, vms) in &by_host {
                for vm in vms {
                    println!("{}/{} {}", host, vm.name, vm.state);
                }
            }
        }
        ListFormat::Table => {
            let rows: Vec<VmRow> = by_host
                .iter()
                .flat_map(|(host, vms)| {
                    vms.iter().map(move |vm| VmRow {
                        host: host.clone(),
                        name: vm.name.clone(),
                        state: vm.state.to_string(),
                        memory: format!("{}M", vm.memory_mib),
                        vcpus: vm.vcpus,
                        disks: format!(
                            "{} ({})",
                            vm.disks.len(),
                            output::format_bytes(vm.total_disk_bytes())
                        ),
                    })
                })
                .collect();

            if rows.is_empty() {
                println!("No VMs found");
            } else {
                let mut table = Table::new(rows);
                table.with(Style::modern());
                println!("{}", table);
            }
        }
    }
    Ok(())
}
