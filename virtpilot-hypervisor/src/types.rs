//! Type definitions for VM configuration and status.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::guest_os::GuestOSFamily;

// =============================================================================
// VM CONFIGURATION
// =============================================================================

/// Default OS profile when a create request does not name one.
pub const DEFAULT_OS_VARIANT: &str = "linux2022";

/// VM configuration for provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Name, unique within one hypervisor connection
    pub name: String,
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Number of vCPUs
    pub vcpus: u32,
    /// Boot disk
    pub disk: DiskConfig,
    /// Install media attached as a CD-ROM (absolute path)
    pub iso_path: Option<String>,
    /// OS profile identifier (e.g. "linux2022", "debian12", "win11")
    pub os_variant: String,
    /// Bridge the NIC is attached to
    pub bridge: String,
}

impl VmConfig {
    /// Create a new VM configuration with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_mib: 1024,
            vcpus: 1,
            disk: DiskConfig::default(),
            iso_path: None,
            os_variant: DEFAULT_OS_VARIANT.to_string(),
            bridge: "br0".to_string(),
        }
    }

    /// Set the number of vCPUs.
    pub fn with_cpu(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, size_mib: u64) -> Self {
        self.memory_mib = size_mib;
        self
    }

    /// Set the boot disk size in GiB.
    pub fn with_disk_size(mut self, size_gib: u64) -> Self {
        self.disk.size_gib = size_gib;
        self
    }

    /// Set the boot disk image path.
    pub fn with_disk_path(mut self, path: impl Into<String>) -> Self {
        self.disk.path = path.into();
        self
    }

    /// Attach install media.
    pub fn with_iso(mut self, iso_path: impl Into<String>) -> Self {
        self.iso_path = Some(iso_path.into());
        self
    }

    /// Set the OS profile.
    pub fn with_os_variant(mut self, os_variant: impl Into<String>) -> Self {
        self.os_variant = os_variant.into();
        self
    }

    /// Set the bridge.
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    /// Guest OS family derived from the OS profile identifier.
    pub fn guest_os(&self) -> GuestOSFamily {
        GuestOSFamily::from_variant(&self.os_variant)
    }
}

/// Disk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path to disk image file (assigned by the backend when empty)
    pub path: String,
    /// Disk size in GiB
    pub size_gib: u64,
    /// Disk format
    pub format: DiskFormat,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            size_gib: 10,
            format: DiskFormat::Qcow2,
        }
    }
}

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Sata,
    Ide,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Get the device prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }
}

/// Disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000e,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000e => "e1000e",
        }
    }
}

// =============================================================================
// VM STATUS
// =============================================================================

/// VM lifecycle state.
///
/// A VM is in exactly one of these at any observation point. Driver-level
/// states that do not map directly (crashed, shut down, pm-suspended) are
/// folded into the closest of the three by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Inactive,
    Running,
    Paused,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Inactive => "inactive",
            VmState::Running => "running",
            VmState::Paused => "paused",
        }
    }

    /// Whether a guest process exists for the VM.
    pub fn is_active(&self) -> bool {
        !matches!(self, VmState::Inactive)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full VM record as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    /// VM name
    pub name: String,
    /// Current state
    pub state: VmState,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Number of vCPUs
    pub vcpus: u32,
    /// Boot disk size in GiB
    pub disk_gib: u64,
    /// Boot disk image path
    pub storage_path: String,
    /// OS profile identifier
    pub os_variant: String,
}

/// Console connection information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// Host to connect to
    pub host: String,
    /// VNC port
    pub port: u16,
    /// Whether a local viewer process was launched
    pub viewer_launched: bool,
}

/// What a snapshot captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Disk state only; reverting leaves the VM inactive
    DiskOnly,
    /// Disk and memory; reverting resumes the VM running
    DiskAndMemory,
}

impl SnapshotKind {
    /// State the VM is in after reverting to a snapshot of this kind.
    pub fn restored_state(&self) -> VmState {
        match self {
            SnapshotKind::DiskOnly => VmState::Inactive,
            SnapshotKind::DiskAndMemory => VmState::Running,
        }
    }
}

/// Snapshot information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot name, unique per VM
    pub name: String,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// What was captured
    pub kind: SnapshotKind,
}

/// Portable VM definition used to move a VM between hypervisors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    /// VM name
    pub name: String,
    /// State on the exporting side at export time
    pub state: VmState,
    /// Backend-native definition document (domain XML for libvirt)
    pub document: String,
    /// Parsed configuration
    pub config: VmConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&VmState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        assert_eq!(VmState::Inactive.to_string(), "inactive");
    }

    #[test]
    fn test_snapshot_kind_restore_target() {
        assert_eq!(SnapshotKind::DiskAndMemory.restored_state(), VmState::Running);
        assert_eq!(SnapshotKind::DiskOnly.restored_state(), VmState::Inactive);
    }

    #[test]
    fn test_config_builder() {
        let config = VmConfig::new("web1")
            .with_memory(2048)
            .with_cpu(2)
            .with_disk_size(20)
            .with_iso("/isos/debian.iso");

        assert_eq!(config.memory_mib, 2048);
        assert_eq!(config.vcpus, 2);
        assert_eq!(config.disk.size_gib, 20);
        assert_eq!(config.iso_path.as_deref(), Some("/isos/debian.iso"));
        assert_eq!(config.os_variant, DEFAULT_OS_VARIANT);
    }
}
