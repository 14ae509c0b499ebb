//! Hypervisor adapter.
//!
//! Queries and mutates VM definitions, storage pools and host capacity by
//! running `virsh` on the remote host through a transport connection. The
//! libvirt daemon is reached with a connection URI (`qemu:///system` by
//! default).

pub mod xml;

use crate::command::{self, VirshArg};
use crate::error::{Result, ShiftError};
use crate::transport::Connection;
use crate::types::{
    DiskFormat, DiskRef, HostCapacity, NetworkInterface, VmDescriptor, VmRunState,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Command timeout for individual virsh invocations.
const VIRSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Requested rewrite of a domain definition for cloning.
#[derive(Debug, Clone)]
pub struct DefinitionRewrite {
    /// New VM name
    pub new_name: String,
    /// Old disk path -> new disk path, in disk order
    pub disk_path_map: Vec<(String, String)>,
    /// Keep the source MAC addresses instead of generating fresh ones
    pub preserve_mac: bool,
    /// Logical network renames (old name -> new name)
    pub network_map: Vec<(String, String)>,
}

/// Result of a definition rewrite.
#[derive(Debug, Clone)]
pub struct RewrittenDefinition {
    pub xml: String,
    /// Fresh UUID assigned to the clone
    pub uuid: String,
    /// MAC addresses now declared by the definition
    pub mac_addresses: Vec<String>,
}

/// Adapter for a remote libvirt daemon.
#[derive(Debug, Clone)]
pub struct Hypervisor {
    uri: String,
}

impl Hypervisor {
    /// Create an adapter for the given libvirt connection URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Run a virsh subcommand, returning stdout. Non-zero exits become
    /// `Hypervisor` errors carrying the subcommand and stderr.
    async fn virsh(
        &self,
        conn: &dyn Connection,
        subcommand: &str,
        args: &[VirshArg<'_>],
    ) -> Result<String> {
        let cmd = command::virsh(&self.uri, subcommand, args)?;
        let output = conn.execute(&cmd, Some(VIRSH_TIMEOUT)).await?;
        if !output.success() {
            return Err(ShiftError::Hypervisor {
                operation: subcommand.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// List VMs on the host, optionally filtered by run state.
    #[instrument(skip(self, conn), fields(host = conn.host()))]
    pub async fn list_vms(
        &self,
        conn: &dyn Connection,
        state_filter: Option<VmRunState>,
    ) -> Result<Vec<VmDescriptor>> {
        let listing =
            self.virsh(conn, "list", &[VirshArg::Flag("--all"), VirshArg::Flag("--name")]).await?;

        let mut vms = Vec::new();
        for name in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.get_vm(conn, name).await {
                Ok(vm) => {
                    if state_filter.is_none_or(|f| vm.state == f) {
                        vms.push(vm);
                    }
                }
                Err(e) => {
                    // A VM can disappear between list and dumpxml.
                    warn!(vm = name, error = %e, "Skipping VM that failed to load");
                }
            }
        }
        Ok(vms)
    }

    /// Load the full descriptor of one VM. Fails with `VmNotFound` when the
    /// domain does not exist.
    #[instrument(skip(self, conn), fields(host = conn.host()))]
    pub async fn get_vm(&self, conn: &dyn Connection, name: &str) -> Result<VmDescriptor> {
        command::validate_vm_name(name)?;

        let cmd = command::virsh(&self.uri, "dumpxml", &[VirshArg::Name(name)])?;
        let output = conn.execute(&cmd, Some(VIRSH_TIMEOUT)).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Err(ShiftError::VmNotFound {
                    name: name.to_string(),
                    host: conn.host().to_string(),
                });
            }
            return Err(ShiftError::Hypervisor {
                operation: "dumpxml".to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        let definition = output.stdout;

        let state_out = self.virsh(conn, "domstate", &[VirshArg::Name(name)]).await?;
        let state = VmRunState::parse(state_out.trim()).unwrap_or(VmRunState::Stopped);

        let mut disks = Vec::new();
        let mut last_modified: Option<DateTime<Utc>> = None;
        for disk in xml::disks(&definition) {
            let (size_bytes, mtime) = self.stat_disk(conn, &disk.source_file).await?;
            if let Some(mtime) = mtime {
                last_modified = Some(last_modified.map_or(mtime, |m| m.max(mtime)));
            }
            disks.push(DiskRef {
                path: disk.source_file,
                size_bytes,
                format: DiskFormat::parse(&disk.driver_type),
                target: disk.target_dev,
            });
        }

        let interfaces = xml::interfaces(&definition)
            .into_iter()
            .map(|i| NetworkInterface {
                name: i.target_dev,
                mac_address: i.mac_address,
                network: i.network,
                ip_address: None,
            })
            .collect();

        let now = Utc::now();
        Ok(VmDescriptor {
            name: xml::element_text(&definition, "name").unwrap_or(name).to_string(),
            uuid: xml::element_text(&definition, "uuid").unwrap_or_default().to_string(),
            state,
            memory_mib: xml::memory_mib(&definition).unwrap_or(0),
            vcpus: xml::vcpus(&definition).unwrap_or(0),
            disks,
            interfaces,
            definition_xml: definition,
            created: now,
            last_modified: last_modified.unwrap_or(now),
            host: conn.host().to_string(),
        })
    }

    /// Virtual size and mtime of a disk file.
    async fn stat_disk(
        &self,
        conn: &dyn Connection,
        path: &str,
    ) -> Result<(u64, Option<DateTime<Utc>>)> {
        let cmd = command::safe("stat --format='%s %Y' {path}", &[("path", path)])?;
        let output = conn.execute(&cmd, Some(VIRSH_TIMEOUT)).await?;
        if !output.success() {
            warn!(path, stderr = %output.stderr.trim(), "Could not stat disk file");
            return Ok((0, None));
        }
        let mut fields = output.stdout.split_whitespace();
        let size = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let mtime = fields
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        Ok((size, mtime))
    }

    /// Whether a VM with this name exists on the host.
    pub async fn vm_exists(&self, conn: &dyn Connection, name: &str) -> Result<bool> {
        command::validate_vm_name(name)?;
        let cmd = command::virsh(&self.uri, "dominfo", &[VirshArg::Name(name)])?;
        let output = conn.execute(&cmd, Some(VIRSH_TIMEOUT)).await?;
        if output.success() {
            return Ok(true);
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(ShiftError::Hypervisor {
            operation: "dominfo".to_string(),
            reason: output.stderr.trim().to_string(),
        })
    }

    /// Aggregate capacity across all active storage pools plus host memory
    /// and CPU counts. Pools are refreshed before reading so free-space
    /// numbers are current.
    #[instrument(skip(self, conn), fields(host = conn.host()))]
    pub async fn host_capacity(&self, conn: &dyn Connection) -> Result<HostCapacity> {
        let pools = self.virsh(conn, "pool-list", &[VirshArg::Flag("--name")]).await?;

        let mut total_disk = 0u64;
        let mut available_disk = 0u64;
        for pool in pools.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Err(e) = self.virsh(conn, "pool-refresh", &[VirshArg::Snapshot(pool)]).await {
                warn!(pool, error = %e, "Could not refresh storage pool");
            }
            match self
                .virsh(conn, "pool-info", &[VirshArg::Flag("--bytes"), VirshArg::Snapshot(pool)])
                .await
            {
                Ok(info) => {
                    let kv = parse_kv(&info);
                    total_disk += parse_leading_u64(kv.get("Capacity"));
                    available_disk += parse_leading_u64(kv.get("Available"));
                }
                Err(e) => warn!(pool, error = %e, "Could not query storage pool"),
            }
        }

        let nodeinfo = parse_kv(&self.virsh(conn, "nodeinfo", &[]).await?);
        let total_memory_kib = parse_leading_u64(nodeinfo.get("Memory size"));
        let total_vcpus = parse_leading_u64(nodeinfo.get("CPU(s)")) as u32;

        let memstats = parse_kv(&self.virsh(conn, "nodememstats", &[]).await?);
        let free_memory_kib = parse_leading_u64(memstats.get("free"));

        // vCPUs claimed by running domains.
        let mut claimed_vcpus = 0u32;
        let running = self.virsh(conn, "list", &[VirshArg::Flag("--name")]).await?;
        for name in running.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Ok(info) = self.virsh(conn, "dominfo", &[VirshArg::Snapshot(name)]).await {
                claimed_vcpus += parse_leading_u64(parse_kv(&info).get("CPU(s)")) as u32;
            }
        }

        Ok(HostCapacity {
            total_disk_bytes: total_disk,
            available_disk_bytes: available_disk,
            total_memory_mib: total_memory_kib / 1024,
            available_memory_mib: free_memory_kib / 1024,
            total_vcpus,
            available_vcpus: total_vcpus.saturating_sub(claimed_vcpus),
        })
    }

    /// Define (but do not start) a VM from a definition document. Returns
    /// the descriptor of the newly defined VM.
    #[instrument(skip(self, conn, definition_xml), fields(host = conn.host()))]
    pub async fn define_vm(
        &self,
        conn: &dyn Connection,
        definition_xml: &str,
    ) -> Result<VmDescriptor> {
        let name = xml::element_text(definition_xml, "name")
            .ok_or_else(|| ShiftError::Hypervisor {
                operation: "define".to_string(),
                reason: "definition has no <name> element".to_string(),
            })?
            .to_string();
        command::validate_vm_name(&name)?;

        // Ship the definition through a remote temp file; virsh define
        // reads from a path.
        let remote_path = format!("/tmp/virtshift-define-{}.xml", Uuid::new_v4());
        let local = tempfile::NamedTempFile::new()
            .map_err(|e| ShiftError::Io { path: "tempfile".into(), source: e })?;
        std::fs::write(local.path(), definition_xml)
            .map_err(|e| ShiftError::Io { path: local.path().to_path_buf(), source: e })?;

        conn.upload(local.path(), &remote_path).await?;
        let define_result = self.virsh(conn, "define", &[VirshArg::Path(&remote_path)]).await;
        let _ = conn.execute(&command::rm_file(&remote_path)?, Some(VIRSH_TIMEOUT)).await;
        define_result?;

        info!(vm = %name, host = conn.host(), "VM defined");
        self.get_vm(conn, &name).await
    }

    /// Remove a VM and all disks its definition references. Idempotent:
    /// succeeds silently when the VM is already gone.
    #[instrument(skip(self, conn), fields(host = conn.host()))]
    pub async fn cleanup_vm(&self, conn: &dyn Connection, name: &str) -> Result<()> {
        command::validate_vm_name(name)?;

        let cmd = command::virsh(&self.uri, "dumpxml", &[VirshArg::Name(name)])?;
        let output = conn.execute(&cmd, Some(VIRSH_TIMEOUT)).await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                debug!(vm = name, "VM not present, nothing to clean up");
                return Ok(());
            }
            return Err(ShiftError::Hypervisor {
                operation: "dumpxml".to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        let definition = output.stdout;

        let state_out = self.virsh(conn, "domstate", &[VirshArg::Name(name)]).await?;
        if VmRunState::parse(state_out.trim()) == Some(VmRunState::Running) {
            info!(vm = name, "Force-stopping VM before cleanup");
            if let Err(e) = self.virsh(conn, "destroy", &[VirshArg::Name(name)]).await {
                warn!(vm = name, error = %e, "Force stop failed, continuing with undefine");
            }
        }

        self.virsh(conn, "undefine", &[VirshArg::Name(name)]).await?;

        for disk in xml::disks(&definition) {
            match command::rm_file(&disk.source_file) {
                Ok(rm) => {
                    let result = conn.execute(&rm, Some(VIRSH_TIMEOUT)).await?;
                    if result.success() {
                        info!(vm = name, path = %disk.source_file, "Deleted disk file");
                    } else {
                        warn!(
                            vm = name,
                            path = %disk.source_file,
                            stderr = %result.stderr.trim(),
                            "Failed to delete disk file"
                        );
                    }
                }
                Err(e) => warn!(vm = name, path = %disk.source_file, error = %e, "Skipping disk"),
            }
        }

        info!(vm = name, host = conn.host(), "VM cleaned up");
        Ok(())
    }

    /// Force-stop (when running) and undefine a VM, leaving its disk files
    /// alone. Succeeds silently when the VM is already gone.
    #[instrument(skip(self, conn), fields(host = conn.host()))]
    pub async fn cleanup_definition(&self, conn: &dyn Connection, name: &str) -> Result<()> {
        command::validate_vm_name(name)?;

        let destroy = command::virsh_destroy(&self.uri, name)?;
        let _ = conn.execute(&destroy, Some(VIRSH_TIMEOUT)).await;

        let undefine = command::virsh_undefine(&self.uri, name)?;
        let output = conn.execute(&undefine, Some(VIRSH_TIMEOUT)).await?;
        if !output.success() && !is_not_found(&output.stderr) {
            return Err(ShiftError::Hypervisor {
                operation: "undefine".to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Create a named snapshot of a VM.
    pub async fn create_snapshot(
        &self,
        conn: &dyn Connection,
        vm_name: &str,
        snapshot_name: &str,
    ) -> Result<()> {
        self.virsh(
            conn,
            "snapshot-create-as",
            &[VirshArg::Name(vm_name), VirshArg::Snapshot(snapshot_name)],
        )
        .await?;
        info!(vm = vm_name, snapshot = snapshot_name, "Snapshot created");
        Ok(())
    }

    /// Delete a named snapshot of a VM.
    pub async fn delete_snapshot(
        &self,
        conn: &dyn Connection,
        vm_name: &str,
        snapshot_name: &str,
    ) -> Result<()> {
        self.virsh(
            conn,
            "snapshot-delete",
            &[VirshArg::Name(vm_name), VirshArg::Snapshot(snapshot_name)],
        )
        .await?;
        Ok(())
    }

    /// Rewrite a source definition for the clone: new name, fresh UUID,
    /// remapped disk paths and (unless preserved) fresh MAC addresses.
    /// Everything else is preserved byte for byte.
    pub fn rewrite_definition(
        &self,
        definition_xml: &str,
        rewrite: &DefinitionRewrite,
    ) -> Result<RewrittenDefinition> {
        command::validate_vm_name(&rewrite.new_name)?;

        let mut xml_doc = xml::set_element_text(definition_xml, "name", &rewrite.new_name)?;
        let new_uuid = Uuid::new_v4().to_string();
        xml_doc = xml::set_element_text(&xml_doc, "uuid", &new_uuid)?;

        for (old, new) in &rewrite.disk_path_map {
            xml_doc = xml::replace_source_file(&xml_doc, old, new);
        }
        for (old, new) in &rewrite.network_map {
            xml_doc = xml::replace_network(&xml_doc, old, new);
        }

        let mac_addresses = if rewrite.preserve_mac {
            xml::interfaces(&xml_doc).into_iter().map(|i| i.mac_address).collect()
        } else {
            let (rewritten, macs) = xml::regenerate_macs(&xml_doc);
            xml_doc = rewritten;
            macs
        };

        Ok(RewrittenDefinition { xml: xml_doc, uuid: new_uuid, mac_addresses })
    }
}

/// Whether virsh stderr indicates a missing domain.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

/// Parse `Key: value` lines into a map. Keys are trimmed; duplicate keys
/// keep the first value.
fn parse_kv(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            map.entry(key.trim().to_string()).or_insert_with(|| value.trim().to_string());
        }
    }
    map
}

/// First integer of an optional `"12345 KiB"`-style value.
fn parse_leading_u64(value: Option<&String>) -> u64 {
    value
        .and_then(|v| v.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
