//! VM domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A VM as seen on a host: the canonical descriptor the hypervisor adapter
/// produces and the orchestrator consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// VM name, unique per host
    pub name: String,

    /// Stable identifier assigned by the hypervisor (UUID string)
    pub uuid: String,

    /// Current run state
    pub state: VmRunState,

    /// Memory in mebibytes
    pub memory_mib: u64,

    /// Virtual CPU count
    pub vcpus: u32,

    /// Ordered disk list, as declared in the definition
    pub disks: Vec<DiskRef>,

    /// Ordered network interface list
    pub interfaces: Vec<NetworkInterface>,

    /// Raw definition document as produced by the hypervisor
    pub definition_xml: String,

    /// Creation timestamp (best effort; libvirt does not persist this)
    pub created: DateTime<Utc>,

    /// Last-modified timestamp (best effort)
    pub last_modified: DateTime<Utc>,

    /// Host the descriptor was read from
    pub host: String,
}

impl VmDescriptor {
    /// Total virtual size of all disks in bytes.
    pub fn total_disk_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.size_bytes).sum()
    }
}

/// VM run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRunState {
    /// VM is running
    Running,

    /// VM is shut off
    Stopped,

    /// VM is paused
    Paused,

    /// VM is PM-suspended
    Suspended,

    /// VM has crashed
    Crashed,
}

impl VmRunState {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::Crashed => "crashed",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" | "blocked" => Some(Self::Running),
            "stopped" | "shut off" | "shutoff" | "shutdown" | "in shutdown" => Some(Self::Stopped),
            "paused" => Some(Self::Paused),
            "suspended" | "pmsuspended" => Some(Self::Suspended),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A disk backing a VM block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRef {
    /// Absolute path on the owning host
    pub path: String,

    /// Virtual size in bytes
    pub size_bytes: u64,

    /// On-disk image format
    pub format: DiskFormat,

    /// Target device label (e.g. "vda")
    pub target: String,
}

impl DiskRef {
    /// File name component of the disk path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qcow2 => "qcow2",
            Self::Raw => "raw",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
        }
    }

    /// Parse from string. Unknown driver types fall back to raw.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "qcow2" => Self::Qcow2,
            "vmdk" => Self::Vmdk,
            "vdi" => Self::Vdi,
            _ => Self::Raw,
        }
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A VM network interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface (target device) name, may be empty for undefined VMs
    pub name: String,

    /// MAC address in colon-separated form
    pub mac_address: String,

    /// Logical network or bridge name
    pub network: String,

    /// Assigned IP address, when known
    pub ip_address: Option<String>,
}

/// Aggregate resource capacity of a host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HostCapacity {
    /// Total bytes across all active storage pools
    pub total_disk_bytes: u64,

    /// Available bytes across all active storage pools
    pub available_disk_bytes: u64,

    /// Total host memory in mebibytes
    pub total_memory_mib: u64,

    /// Free host memory in mebibytes
    pub available_memory_mib: u64,

    /// Total host vCPUs
    pub total_vcpus: u32,

    /// vCPUs not claimed by running VMs
    pub available_vcpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_parse() {
        assert_eq!(VmRunState::parse("running"), Some(VmRunState::Running));
        assert_eq!(VmRunState::parse("shut off"), Some(VmRunState::Stopped));
        assert_eq!(VmRunState::parse("PAUSED"), Some(VmRunState::Paused));
        assert_eq!(VmRunState::parse("pmsuspended"), Some(VmRunState::Suspended));
        assert_eq!(VmRunState::parse("crashed"), Some(VmRunState::Crashed));
        assert_eq!(VmRunState::parse("weird"), None);
    }

    #[test]
    fn test_disk_format_parse() {
        assert_eq!(DiskFormat::parse("qcow2"), DiskFormat::Qcow2);
        assert_eq!(DiskFormat::parse("QCOW2"), DiskFormat::Qcow2);
        assert_eq!(DiskFormat::parse("something"), DiskFormat::Raw);
    }

    #[test]
    fn test_disk_basename() {
        let disk = DiskRef {
            path: "/var/lib/libvirt/images/web01.qcow2".to_string(),
            size_bytes: 0,
            format: DiskFormat::Qcow2,
            target: "vda".to_string(),
        };
        assert_eq!(disk.basename(), "web01.qcow2");
    }
}
