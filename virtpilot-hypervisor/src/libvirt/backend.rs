//! Libvirt backend implementation.
//!
//! The `virt` bindings are synchronous: every call blocks its thread until
//! libvirtd answers. All of them run on tokio's blocking pool, so a hung
//! daemon never pins an async worker and a timeout around one of these
//! futures still fires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn, Span};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, Hypervisor, HypervisorCapabilities};
use crate::types::*;
use crate::xml::{rewrite_for_clone, snapshot_xml, volume_xml, DomainSummary, DomainXmlBuilder};

const GIB: u64 = 1024 * 1024 * 1024;

fn poisoned() -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

/// Run a blocking driver call on tokio's blocking pool, inside the caller's span.
async fn off_runtime<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(call))
        .await
        .map_err(|e| HypervisorError::Internal(format!("driver call did not complete: {}", e)))?
}

/// Incoming migrations that are not (yet) defined in libvirt.
///
/// A confirmation can outlive the caller that asked for it: the define keeps
/// running on the blocking pool after a timeout drops its future. An abort
/// that lands during the define marks the entry abandoned, and the define
/// undoes itself when it returns.
#[derive(Default)]
struct IncomingTable {
    entries: Mutex<HashMap<String, Incoming>>,
}

enum Incoming {
    /// Waiting for confirmation, holding the inactive domain XML
    Staged(String),
    /// Handed to `virDomainDefineXML`
    Defining,
    /// Aborted while the define was in flight
    Abandoned,
}

/// What an abort found.
#[derive(Debug, PartialEq, Eq)]
enum Abort {
    /// Only staged; nothing reached libvirt
    Dropped,
    /// A define is in flight and will undo itself
    Deferred,
    /// Unknown here; a confirmed definition may exist in libvirt
    NotTracked,
}

impl IncomingTable {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Incoming>>> {
        self.entries.lock().map_err(|_| poisoned())
    }

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    fn stage(&self, name: &str, xml: String) -> Result<()> {
        let mut entries = self.lock()?;
        if entries.contains_key(name) {
            return Err(HypervisorError::VmAlreadyExists(name.to_string()));
        }
        entries.insert(name.to_string(), Incoming::Staged(xml));
        Ok(())
    }

    /// Take the staged XML for definition.
    fn begin_define(&self, name: &str) -> Result<String> {
        let mut entries = self.lock()?;
        match entries.remove(name) {
            Some(Incoming::Staged(xml)) => {
                entries.insert(name.to_string(), Incoming::Defining);
                Ok(xml)
            }
            Some(other) => {
                entries.insert(name.to_string(), other);
                Err(HypervisorError::MigrationFailed(format!(
                    "incoming VM '{}' is already being confirmed",
                    name
                )))
            }
            None => Err(HypervisorError::VmNotFound(name.to_string())),
        }
    }

    /// Forget a finished define. Returns true if it was abandoned meanwhile.
    fn finish_define(&self, name: &str) -> Result<bool> {
        Ok(matches!(self.lock()?.remove(name), Some(Incoming::Abandoned)))
    }

    fn abort(&self, name: &str) -> Result<Abort> {
        let mut entries = self.lock()?;
        match entries.remove(name) {
            Some(Incoming::Staged(_)) => Ok(Abort::Dropped),
            Some(Incoming::Defining) | Some(Incoming::Abandoned) => {
                entries.insert(name.to_string(), Incoming::Abandoned);
                Ok(Abort::Deferred)
            }
            None => Ok(Abort::NotTracked),
        }
    }
}

/// The libvirt connection and everything the blocking calls need.
struct Session {
    uri: String,
    storage_pool: String,
    connection: Connect,
    incoming: IncomingTable,
}

impl Session {
    /// Wrap a driver error, reporting a dead connection as such.
    fn driver_error(&self, wrap: fn(String) -> HypervisorError, e: virt::error::Error) -> HypervisorError {
        if matches!(self.connection.is_alive(), Ok(true)) {
            wrap(e.to_string())
        } else {
            HypervisorError::ConnectionLost(format!("{}: {}", self.uri, e))
        }
    }

    fn get_domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name).map_err(|e| {
            match self.driver_error(HypervisorError::QueryFailed, e) {
                lost @ HypervisorError::ConnectionLost(_) => lost,
                _ => HypervisorError::VmNotFound(name.to_string()),
            }
        })
    }

    fn domain_state(&self, domain: &Domain) -> Result<VmState> {
        let (state, _) = domain
            .get_state()
            .map_err(|e| self.driver_error(HypervisorError::QueryFailed, e))?;
        Ok(state_from_libvirt(state))
    }

    fn inactive_xml(&self, domain: &Domain) -> Result<String> {
        domain
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| self.driver_error(HypervisorError::QueryFailed, e))
    }

    fn pool(&self) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, &self.storage_pool).map_err(|e| {
            self.driver_error(HypervisorError::CreateFailed, e)
        })
    }

    fn disk_size_gib(&self, path: &str) -> u64 {
        StorageVol::lookup_by_path(&self.connection, path)
            .and_then(|vol| vol.get_info())
            .map(|info| info.capacity / GIB)
            .unwrap_or(0)
    }

    fn vm_exists(&self, name: &str) -> Result<bool> {
        Ok(self.incoming.contains(name)? || Domain::lookup_by_name(&self.connection, name).is_ok())
    }

    fn vm_info(&self, domain: &Domain) -> Result<VmInfo> {
        let state = self.domain_state(domain)?;
        let summary = DomainSummary::parse(&self.inactive_xml(domain)?)?;
        let disk_path = summary.disk_path.clone().unwrap_or_default();

        Ok(VmInfo {
            name: summary.name.clone(),
            state,
            memory_mib: summary.memory_mib,
            vcpus: summary.vcpus,
            disk_gib: self.disk_size_gib(&disk_path),
            storage_path: disk_path,
            os_variant: summary
                .os_variant
                .unwrap_or_else(|| DEFAULT_OS_VARIANT.to_string()),
        })
    }
}

/// Convert libvirt domain state to VmState.
fn state_from_libvirt(state: sys::virDomainState) -> VmState {
    match state {
        sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED | sys::VIR_DOMAIN_SHUTDOWN => {
            VmState::Running
        }
        sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => VmState::Paused,
        _ => VmState::Inactive,
    }
}

/// Libvirt/QEMU hypervisor backend.
///
/// One instance wraps one libvirt connection. Disks live as qcow2 volumes in
/// a storage pool (named by `storage_pool`), which is also where clones are
/// written. Snapshot operations shell out to `virsh` because the `virt`
/// crate does not expose the snapshot API.
pub struct LibvirtBackend {
    session: Arc<Session>,
}

impl LibvirtBackend {
    /// Create a new libvirt backend connected to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str, storage_pool: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let target = uri.to_string();
        let connection = off_runtime(move || {
            Connect::open(Some(&target))
                .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", target, e)))
        })
        .await?;

        info!(uri = %uri, "Connected to libvirt");

        Ok(Self {
            session: Arc::new(Session {
                uri: uri.to_string(),
                storage_pool: storage_pool.to_string(),
                connection,
                incoming: IncomingTable::default(),
            }),
        })
    }

    /// Run driver calls against this session on the blocking pool.
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        off_runtime(move || call(&session)).await
    }

    async fn ensure_domain(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |s| s.get_domain(&name).map(|_| ())).await
    }

    /// Run virsh against this connection's URI.
    async fn virsh(&self, args: &[&str], stdin: Option<&str>) -> std::io::Result<Output> {
        let mut cmd = Command::new("virsh");
        cmd.arg("--connect")
            .arg(&self.session.uri)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
        }
        child.wait_with_output().await
    }

    async fn virsh_checked(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let output = self
            .virsh(args, stdin)
            .await
            .map_err(|e| HypervisorError::SnapshotFailed(format!("virsh command failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::SnapshotFailed(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse the table printed by `virsh snapshot-list <domain>`.
///
/// ```text
///  Name    Creation Time               State
/// ---------------------------------------------
///  snap1   2024-05-01 10:00:00 +0000   running
/// ```
fn parse_snapshot_table(table: &str) -> Vec<SnapshotInfo> {
    let mut snapshots: Vec<SnapshotInfo> = table
        .lines()
        .skip(2)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, date, time, tz, state] = fields.as_slice() else {
                return None;
            };
            let created_at = chrono::DateTime::parse_from_str(
                &format!("{} {} {}", date, time, tz),
                "%Y-%m-%d %H:%M:%S %z",
            )
            .ok()?
            .with_timezone(&chrono::Utc);

            Some(SnapshotInfo {
                name: name.to_string(),
                created_at,
                kind: if *state == "running" || *state == "paused" {
                    SnapshotKind::DiskAndMemory
                } else {
                    SnapshotKind::DiskOnly
                },
            })
        })
        .collect();

    snapshots.sort_by_key(|s| s.created_at);
    snapshots
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.session.uri
    }

    #[instrument(skip(self))]
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        let version = self
            .blocking(|s| {
                s.connection
                    .get_lib_version()
                    .map_err(|e| s.driver_error(HypervisorError::QueryFailed, e))
            })
            .await?;

        let major = version / 1_000_000;
        let minor = (version / 1000) % 1000;
        let micro = version % 1000;

        Ok(HypervisorCapabilities {
            name: "libvirt/QEMU".to_string(),
            version: format!("{}.{}.{}", major, minor, micro),
            supports_live_migration: true,
            supports_snapshots: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        self.blocking(|s| Ok(matches!(s.connection.is_alive(), Ok(true))))
            .await
    }

    #[instrument(skip(self, config), fields(vm = %config.name))]
    async fn create_vm(&self, mut config: VmConfig) -> Result<VmInfo> {
        info!("Creating VM");

        self.blocking(move |s| {
            if Domain::lookup_by_name(&s.connection, &config.name).is_ok() {
                return Err(HypervisorError::VmAlreadyExists(config.name));
            }

            let pool = s.pool()?;
            let volume = StorageVol::create_xml(
                &pool,
                &volume_xml(&config.name, config.disk.size_gib, config.disk.format),
                0,
            )
            .map_err(|e| s.driver_error(HypervisorError::CreateFailed, e))?;

            config.disk.path = volume
                .get_path()
                .map_err(|e| s.driver_error(HypervisorError::CreateFailed, e))?;

            let xml = DomainXmlBuilder::new(&config).build();
            debug!(xml = %xml, "Generated domain XML");

            let domain = match Domain::define_xml(&s.connection, &xml) {
                Ok(domain) => domain,
                Err(e) => {
                    // Don't leave an orphaned disk behind
                    if let Err(cleanup) = volume.delete(0) {
                        warn!(error = %cleanup, "Failed to remove volume after define failure");
                    }
                    return Err(s.driver_error(HypervisorError::CreateFailed, e));
                }
            };

            info!(path = %config.disk.path, "VM created");
            s.vm_info(&domain)
        })
        .await
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        info!("Starting VM");

        let name = name.to_string();
        self.blocking(move |s| {
            s.get_domain(&name)?
                .create()
                .map_err(|e| s.driver_error(HypervisorError::StartFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM started");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn stop_vm(&self, name: &str) -> Result<()> {
        info!("Powering off VM");

        let name = name.to_string();
        self.blocking(move |s| {
            s.get_domain(&name)?
                .destroy()
                .map_err(|e| s.driver_error(HypervisorError::StopFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn pause_vm(&self, name: &str) -> Result<()> {
        info!("Pausing VM");

        let name = name.to_string();
        self.blocking(move |s| {
            s.get_domain(&name)?
                .suspend()
                .map_err(|e| s.driver_error(HypervisorError::OperationFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM paused");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn resume_vm(&self, name: &str) -> Result<()> {
        info!("Resuming VM");

        let name = name.to_string();
        self.blocking(move |s| {
            s.get_domain(&name)?
                .resume()
                .map_err(|e| s.driver_error(HypervisorError::OperationFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM resumed");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn delete_vm(&self, name: &str) -> Result<()> {
        info!("Deleting VM");

        let name = name.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;
            if s.domain_state(&domain)?.is_active() {
                return Err(HypervisorError::DeleteFailed(
                    "VM must be stopped before deletion".to_string(),
                ));
            }

            let disk_path = DomainSummary::parse(&s.inactive_xml(&domain)?)?.disk_path;

            domain
                .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA)
                .map_err(|e| s.driver_error(HypervisorError::DeleteFailed, e))?;

            // Internal snapshots live inside the qcow2 image and go with it
            if let Some(path) = disk_path {
                match StorageVol::lookup_by_path(&s.connection, &path) {
                    Ok(volume) => volume
                        .delete(0)
                        .map_err(|e| s.driver_error(HypervisorError::DeleteFailed, e))?,
                    Err(e) => warn!(path = %path, error = %e, "Disk volume not found, skipping"),
                }
            }
            Ok(())
        })
        .await?;

        info!("VM deleted");
        Ok(())
    }

    async fn get_vm_state(&self, name: &str) -> Result<VmState> {
        let name = name.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;
            s.domain_state(&domain)
        })
        .await
    }

    async fn get_vm(&self, name: &str) -> Result<VmInfo> {
        let name = name.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;
            s.vm_info(&domain)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let vms = self
            .blocking(|s| {
                let flags =
                    sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
                let domains = s
                    .connection
                    .list_all_domains(flags)
                    .map_err(|e| s.driver_error(HypervisorError::QueryFailed, e))?;

                let mut vms = Vec::with_capacity(domains.len());
                for domain in &domains {
                    vms.push(s.vm_info(domain)?);
                }
                vms.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(vms)
            })
            .await?;

        debug!(count = vms.len(), "Listed VMs");
        Ok(vms)
    }

    async fn vm_exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.blocking(move |s| s.vm_exists(&name)).await
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn open_console(&self, name: &str) -> Result<ConsoleInfo> {
        let target = name.to_string();
        let xml = self
            .blocking(move |s| {
                s.get_domain(&target)?
                    .get_xml_desc(0)
                    .map_err(|e| s.driver_error(HypervisorError::QueryFailed, e))
            })
            .await?;

        let port = DomainSummary::parse(&xml)?.vnc_port.ok_or_else(|| {
            HypervisorError::OperationFailed("VM has no active VNC display".to_string())
        })?;

        // The viewer is fire-and-forget; headless hosts simply don't get one
        let viewer_launched = match Command::new("virt-viewer")
            .args(["--connect", &self.session.uri, name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Could not launch virt-viewer");
                false
            }
        };

        Ok(ConsoleInfo {
            host: "0.0.0.0".to_string(),
            port,
            viewer_launched,
        })
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        include_memory: bool,
    ) -> Result<SnapshotInfo> {
        info!(include_memory, "Creating snapshot");

        if self.list_snapshots(name).await?.iter().any(|s| s.name == snapshot) {
            return Err(HypervisorError::SnapshotAlreadyExists(snapshot.to_string()));
        }

        let xml = snapshot_xml(snapshot, include_memory);
        self.virsh_checked(
            &["snapshot-create", name, "--xmldesc", "/dev/stdin"],
            Some(&xml),
        )
        .await?;

        info!("Snapshot created via virsh");

        Ok(SnapshotInfo {
            name: snapshot.to_string(),
            created_at: chrono::Utc::now(),
            kind: if include_memory {
                SnapshotKind::DiskAndMemory
            } else {
                SnapshotKind::DiskOnly
            },
        })
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>> {
        self.ensure_domain(name).await?;
        let table = self.virsh_checked(&["snapshot-list", name], None).await?;
        Ok(parse_snapshot_table(&table))
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        info!("Reverting to snapshot");

        if !self.list_snapshots(name).await?.iter().any(|s| s.name == snapshot) {
            return Err(HypervisorError::SnapshotNotFound(snapshot.to_string()));
        }

        self.virsh_checked(&["snapshot-revert", name, snapshot], None)
            .await?;

        info!("Reverted to snapshot via virsh");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        info!("Deleting snapshot");

        if !self.list_snapshots(name).await?.iter().any(|s| s.name == snapshot) {
            return Err(HypervisorError::SnapshotNotFound(snapshot.to_string()));
        }

        self.virsh_checked(&["snapshot-delete", name, snapshot], None)
            .await?;

        info!("Snapshot deleted via virsh");
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source, target = %target))]
    async fn clone_vm(&self, source: &str, target: &str) -> Result<VmInfo> {
        info!("Cloning VM");

        let source = source.to_string();
        let target = target.to_string();
        self.blocking(move |s| {
            if s.vm_exists(&target)? {
                return Err(HypervisorError::VmAlreadyExists(target));
            }

            let domain = s.get_domain(&source)?;
            if s.domain_state(&domain)?.is_active() {
                return Err(HypervisorError::InvalidState(
                    "cannot copy the disk of an active VM".to_string(),
                ));
            }

            let xml = s.inactive_xml(&domain)?;
            let old_disk = DomainSummary::parse(&xml)?
                .disk_path
                .ok_or_else(|| HypervisorError::CloneFailed("source VM has no disk".to_string()))?;

            let source_vol = StorageVol::lookup_by_path(&s.connection, &old_disk)
                .map_err(|e| s.driver_error(HypervisorError::CloneFailed, e))?;
            let pool = StoragePool::lookup_by_volume(&source_vol)
                .map_err(|e| s.driver_error(HypervisorError::CloneFailed, e))?;
            let capacity_gib = source_vol
                .get_info()
                .map(|info| info.capacity.div_ceil(GIB))
                .map_err(|e| s.driver_error(HypervisorError::CloneFailed, e))?;

            let target_vol = StorageVol::create_xml_from(
                &pool,
                &volume_xml(&target, capacity_gib, DiskFormat::Qcow2),
                &source_vol,
                0,
            )
            .map_err(|e| s.driver_error(HypervisorError::CloneFailed, e))?;

            let new_disk = target_vol
                .get_path()
                .map_err(|e| s.driver_error(HypervisorError::CloneFailed, e))?;

            let clone_xml = rewrite_for_clone(&xml, &target, &old_disk, &new_disk)?;
            let clone = match Domain::define_xml(&s.connection, &clone_xml) {
                Ok(clone) => clone,
                Err(e) => {
                    if let Err(cleanup) = target_vol.delete(0) {
                        warn!(error = %cleanup, "Failed to remove copied volume");
                    }
                    return Err(s.driver_error(HypervisorError::CloneFailed, e));
                }
            };

            info!(path = %new_disk, "VM cloned");
            s.vm_info(&clone)
        })
        .await
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn export_vm(&self, name: &str) -> Result<VmDefinition> {
        let name = name.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;
            let state = s.domain_state(&domain)?;
            let document = s.inactive_xml(&domain)?;
            let summary = DomainSummary::parse(&document)?;
            let disk_gib = summary
                .disk_path
                .as_deref()
                .map(|p| s.disk_size_gib(p))
                .unwrap_or(0);

            Ok(VmDefinition {
                name,
                state,
                config: summary.to_config(disk_gib),
                document,
            })
        })
        .await
    }

    #[instrument(skip(self, definition), fields(vm = %definition.name))]
    async fn prepare_incoming(&self, definition: &VmDefinition) -> Result<()> {
        let definition = definition.clone();
        self.blocking(move |s| {
            if s.vm_exists(&definition.name)? {
                return Err(HypervisorError::VmAlreadyExists(definition.name));
            }

            // Storage is shared; the destination must already see the disk
            let disk = &definition.config.disk.path;
            if !disk.is_empty() {
                StorageVol::lookup_by_path(&s.connection, disk).map_err(|e| {
                    s.driver_error(
                        |msg| HypervisorError::MigrationFailed(format!("disk not visible on destination: {}", msg)),
                        e,
                    )
                })?;
            }

            s.incoming.stage(&definition.name, definition.document)
        })
        .await?;

        info!("Incoming VM staged");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn confirm_incoming(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |s| {
            let xml = s.incoming.begin_define(&name)?;
            let defined = Domain::define_xml(&s.connection, &xml);
            let abandoned = s.incoming.finish_define(&name)?;
            let domain = defined.map_err(|e| s.driver_error(HypervisorError::MigrationFailed, e))?;

            if abandoned {
                warn!(vm = %name, "Incoming VM was aborted while being defined, undefining it");
                domain
                    .undefine()
                    .map_err(|e| s.driver_error(HypervisorError::MigrationFailed, e))?;
                return Err(HypervisorError::MigrationFailed(format!(
                    "incoming VM '{}' was aborted",
                    name
                )));
            }

            info!("Incoming VM defined");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn abort_incoming(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |s| {
            match s.incoming.abort(&name)? {
                Abort::Dropped => {}
                Abort::Deferred => debug!("Define still in flight, it will undo itself"),
                Abort::NotTracked => {
                    if let Ok(domain) = Domain::lookup_by_name(&s.connection, &name) {
                        if !s.domain_state(&domain)?.is_active() {
                            domain
                                .undefine()
                                .map_err(|e| s.driver_error(HypervisorError::MigrationFailed, e))?;
                        }
                    }
                }
            }
            Ok(())
        })
        .await?;

        info!("Incoming VM discarded");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name, dest = %dest_uri))]
    async fn migrate_live(&self, name: &str, dest_uri: &str) -> Result<()> {
        info!("Live-migrating VM");

        let name = name.to_string();
        let dest_uri = dest_uri.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;

            let target_conn = Connect::open(Some(&dest_uri)).map_err(|e| {
                HypervisorError::MigrationFailed(format!("Failed to connect to target: {}", e))
            })?;

            // The destination already holds the confirmed definition; the
            // source keeps its own until it is released
            let flags = sys::VIR_MIGRATE_LIVE | sys::VIR_MIGRATE_PERSIST_DEST;
            domain
                .migrate(&target_conn, flags, None, None, 0)
                .map_err(|e| s.driver_error(HypervisorError::MigrationFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM migrated");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn release_vm(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |s| {
            let domain = s.get_domain(&name)?;
            if s.domain_state(&domain)?.is_active() {
                return Err(HypervisorError::InvalidState(
                    "VM must be stopped before release".to_string(),
                ));
            }

            domain
                .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA)
                .map_err(|e| s.driver_error(HypervisorError::MigrationFailed, e))?;
            Ok(())
        })
        .await?;

        info!("VM definition released");
        Ok(())
    }
}

/// Opens [`LibvirtBackend`] sessions.
pub struct LibvirtConnector {
    storage_pool: String,
}

impl LibvirtConnector {
    pub fn new(storage_pool: impl Into<String>) -> Self {
        Self {
            storage_pool: storage_pool.into(),
        }
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        let backend = LibvirtBackend::new(uri, &self.storage_pool).await?;
        Ok(Arc::new(backend) as Arc<dyn Hypervisor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_table() {
        let table = " Name    Creation Time               State
---------------------------------------------------
 later   2024-05-01 12:00:00 +0000   shutoff
 first   2024-05-01 10:00:00 +0000   running
";
        let snapshots = parse_snapshot_table(table);
        let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "later"]);
        assert_eq!(snapshots[0].kind, SnapshotKind::DiskAndMemory);
        assert_eq!(snapshots[1].kind, SnapshotKind::DiskOnly);
    }

    #[test]
    fn test_parse_empty_snapshot_table() {
        let table = " Name   Creation Time   State\n------------------------------\n\n";
        assert!(parse_snapshot_table(table).is_empty());
    }

    #[test]
    fn test_incoming_abort_before_define() {
        let table = IncomingTable::default();
        table.stage("mover", "<domain/>".to_string()).unwrap();
        assert!(table.contains("mover").unwrap());

        assert_eq!(table.abort("mover").unwrap(), Abort::Dropped);
        assert!(!table.contains("mover").unwrap());
        assert!(matches!(
            table.begin_define("mover"),
            Err(HypervisorError::VmNotFound(_))
        ));
    }

    #[test]
    fn test_incoming_abort_during_define_is_undone_by_definer() {
        let table = IncomingTable::default();
        table.stage("mover", "<domain/>".to_string()).unwrap();

        assert_eq!(table.begin_define("mover").unwrap(), "<domain/>");
        assert_eq!(table.abort("mover").unwrap(), Abort::Deferred);
        assert!(table.contains("mover").unwrap());

        assert!(table.finish_define("mover").unwrap());
        assert!(!table.contains("mover").unwrap());
        assert_eq!(table.abort("mover").unwrap(), Abort::NotTracked);
    }

    #[test]
    fn test_incoming_define_completes() {
        let table = IncomingTable::default();
        table.stage("mover", "<domain/>".to_string()).unwrap();
        assert!(matches!(
            table.stage("mover", "<domain/>".to_string()),
            Err(HypervisorError::VmAlreadyExists(_))
        ));

        table.begin_define("mover").unwrap();
        assert!(table.begin_define("mover").is_err());
        assert!(!table.finish_define("mover").unwrap());
        assert!(!table.contains("mover").unwrap());
    }

    #[tokio::test]
    async fn test_timeout_fires_while_driver_call_blocks() {
        let call = off_runtime(|| {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(())
        });

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), call).await;
        assert!(result.is_err());
        assert!(started.elapsed() < std::time::Duration::from_millis(250));
    }
}
