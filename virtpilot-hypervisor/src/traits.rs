//! Core hypervisor abstraction traits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::*;

/// Capabilities supported by a hypervisor backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypervisorCapabilities {
    /// Name of the hypervisor (e.g., "libvirt/QEMU", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Supports live migration
    pub supports_live_migration: bool,
    /// Supports snapshots
    pub supports_snapshots: bool,
}

/// One session to a hypervisor endpoint.
///
/// VMs are addressed by name, which is unique within a connection. Every
/// method reports driver failures as [`crate::HypervisorError`]; callers are
/// expected to normalize them. Implementations do not enforce lifecycle
/// rules beyond what the driver itself rejects.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// URI this session was opened against.
    fn uri(&self) -> &str;

    /// Get hypervisor capabilities.
    async fn capabilities(&self) -> Result<HypervisorCapabilities>;

    /// Check if the connection is still usable.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // VM Lifecycle
    // =========================================================================

    /// Provision storage and define a new VM. The VM is left inactive.
    async fn create_vm(&self, config: VmConfig) -> Result<VmInfo>;

    /// Boot an inactive VM.
    async fn start_vm(&self, name: &str) -> Result<()>;

    /// Power off a VM, running or paused.
    async fn stop_vm(&self, name: &str) -> Result<()>;

    /// Pause a VM (freeze execution).
    async fn pause_vm(&self, name: &str) -> Result<()>;

    /// Resume a paused VM.
    async fn resume_vm(&self, name: &str) -> Result<()>;

    /// Undefine an inactive VM and delete its storage and snapshots.
    async fn delete_vm(&self, name: &str) -> Result<()>;

    // =========================================================================
    // VM Status
    // =========================================================================

    /// Get the current state of one VM.
    async fn get_vm_state(&self, name: &str) -> Result<VmState>;

    /// Get the full VM record.
    async fn get_vm(&self, name: &str) -> Result<VmInfo>;

    /// List all VMs defined on this connection.
    async fn list_vms(&self) -> Result<Vec<VmInfo>>;

    /// Check if a VM exists.
    async fn vm_exists(&self, name: &str) -> Result<bool>;

    // =========================================================================
    // Console
    // =========================================================================

    /// Open a console session for the VM and return its endpoint.
    async fn open_console(&self, name: &str) -> Result<ConsoleInfo>;

    // =========================================================================
    // Snapshots & Clones
    // =========================================================================

    /// Create a snapshot. Memory is included when `include_memory` is set.
    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        include_memory: bool,
    ) -> Result<SnapshotInfo>;

    /// List snapshots in creation order.
    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>>;

    /// Revert a VM to a snapshot.
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()>;

    /// Copy an inactive VM's storage and define the copy under `target`.
    async fn clone_vm(&self, source: &str, target: &str) -> Result<VmInfo>;

    // =========================================================================
    // Migration
    // =========================================================================

    /// Export a VM's definition for transfer to another hypervisor.
    async fn export_vm(&self, name: &str) -> Result<VmDefinition>;

    /// Stage an incoming VM. A staged VM is not listed and cannot be started
    /// until it is confirmed.
    async fn prepare_incoming(&self, definition: &VmDefinition) -> Result<()>;

    /// Acknowledge a staged VM, making it a regular (inactive) VM.
    async fn confirm_incoming(&self, name: &str) -> Result<()>;

    /// Discard a staged or freshly confirmed incoming VM without touching
    /// storage, which still belongs to the source.
    async fn abort_incoming(&self, name: &str) -> Result<()>;

    /// Move a running or paused VM's execution to the hypervisor at
    /// `dest_uri`, which must already hold its confirmed definition.
    ///
    /// Guest memory is copied while the VM runs, and the guest continues on
    /// the destination in the same state without rebooting. Afterwards the
    /// local definition is inactive. On failure the VM keeps running here.
    async fn migrate_live(&self, name: &str, dest_uri: &str) -> Result<()>;

    /// Remove a VM definition while keeping its storage, after it has been
    /// handed over to another hypervisor.
    async fn release_vm(&self, name: &str) -> Result<()>;
}

/// Opens hypervisor sessions by URI.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh session to `uri`.
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>>;
}
