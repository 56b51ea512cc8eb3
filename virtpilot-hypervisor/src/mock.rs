//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, Hypervisor, HypervisorCapabilities};
use crate::types::*;
use crate::xml::DomainXmlBuilder;

/// Storage root used for disk paths assigned by the mock backend.
pub const MOCK_STORAGE_PATH: &str = "/var/lib/virtpilot/mock";

/// Operations that can be targeted by fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Stop,
    Pause,
    Resume,
    Delete,
    Console,
    CreateSnapshot,
    RevertSnapshot,
    DeleteSnapshot,
    Clone,
    Export,
    PrepareIncoming,
    ConfirmIncoming,
    AbortIncoming,
    MigrateLive,
    Release,
}

/// Simulated hosts by URI, shared by a connector and the backends it opens.
type HostMap = Mutex<HashMap<String, Arc<MockBackend>>>;

/// Mock hypervisor backend for testing.
///
/// This backend simulates one hypervisor host in memory without requiring
/// an actual hypervisor. On top of the VM model it supports:
/// - Per-operation fault injection (one-shot failures)
/// - Artificial latency, to widen race windows in concurrency tests
/// - Tracking of concurrent calls per VM
/// - Simulated session loss
///
/// Backends opened through a [`MockConnector`] can see each other, which is
/// what lets a guest move between hosts with [`Hypervisor::migrate_live`].
pub struct MockBackend {
    uri: String,
    peers: Weak<HostMap>,
    vms: RwLock<BTreeMap<String, MockVm>>,
    snapshots: RwLock<HashMap<String, Vec<SnapshotInfo>>>,
    incoming: RwLock<HashMap<String, MockVm>>,
    connected: AtomicBool,
    latency: Mutex<Duration>,
    confirm_delay: Mutex<Option<Duration>>,
    failures: Mutex<HashMap<MockOp, HypervisorError>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_in_flight: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(MockOp, String)>>,
}

#[derive(Clone)]
struct MockVm {
    config: VmConfig,
    state: VmState,
    /// Number of cold boots of the guest; carried along by live migration
    boots: u64,
}

impl MockVm {
    fn defined(config: VmConfig) -> Self {
        Self {
            config,
            state: VmState::Inactive,
            boots: 0,
        }
    }

    fn info(&self) -> VmInfo {
        VmInfo {
            name: self.config.name.clone(),
            state: self.state,
            memory_mib: self.config.memory_mib,
            vcpus: self.config.vcpus,
            disk_gib: self.config.disk.size_gib,
            storage_path: self.config.disk.path.clone(),
            os_variant: self.config.os_variant.clone(),
        }
    }
}

fn poisoned() -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

/// Decrements the per-VM call counter when a mock operation finishes.
struct InFlight<'a> {
    backend: &'a MockBackend,
    name: String,
}

impl<'a> InFlight<'a> {
    fn enter(backend: &'a MockBackend, name: &str) -> Result<Self> {
        let mut in_flight = backend.in_flight.lock().map_err(|_| poisoned())?;
        let current = in_flight.entry(name.to_string()).or_default();
        *current += 1;

        let mut peak = backend.peak_in_flight.lock().map_err(|_| poisoned())?;
        let max = peak.entry(name.to_string()).or_default();
        *max = (*max).max(*current);

        Ok(Self {
            backend,
            name: name.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.backend.in_flight.lock() {
            if let Some(current) = in_flight.get_mut(&self.name) {
                *current = current.saturating_sub(1);
            }
        }
    }
}

impl MockBackend {
    /// Create a new mock backend for the given URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_peers(uri, Weak::new())
    }

    fn with_peers(uri: impl Into<String>, peers: Weak<HostMap>) -> Self {
        let uri = uri.into();
        info!(uri = %uri, "Creating mock hypervisor backend");
        Self {
            uri,
            peers,
            vms: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            confirm_delay: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            peak_in_flight: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every operation sleep for `latency` before taking effect.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// Delay incoming-migration acknowledgments by `delay`.
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.confirm_delay.lock() {
            *current = delay;
        }
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: MockOp, error: HypervisorError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op, error);
        }
    }

    /// Simulate the session dropping. Calls fail until [`Self::reconnect`].
    pub fn disconnect(&self) {
        warn!(uri = %self.uri, "Mock session disconnected");
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Re-establish a dropped session.
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Highest number of operations observed running at once against `name`.
    pub fn peak_concurrency(&self, name: &str) -> usize {
        self.peak_in_flight
            .lock()
            .map(|peak| peak.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of completed or attempted calls of `op`.
    pub fn call_count(&self, op: MockOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|(o, _)| *o == op).count())
            .unwrap_or(0)
    }

    /// How many times the guest has been cold-booted, if the VM exists.
    pub fn boot_count(&self, name: &str) -> Option<u64> {
        self.vms
            .read()
            .ok()
            .and_then(|vms| vms.get(name).map(|vm| vm.boots))
    }

    /// Whether a staged incoming VM with this name exists.
    pub fn has_incoming(&self, name: &str) -> bool {
        self.incoming
            .read()
            .map(|incoming| incoming.contains_key(name))
            .unwrap_or(false)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HypervisorError::ConnectionLost(format!(
                "session to {} is closed",
                self.uri
            )))
        }
    }

    /// Common prologue for every mutating call.
    async fn begin(&self, op: MockOp, name: &str) -> Result<InFlight<'_>> {
        self.ensure_connected()?;
        let guard = InFlight::enter(self, name)?;

        self.calls
            .lock()
            .map_err(|_| poisoned())?
            .push((op, name.to_string()));

        let latency = *self.latency.lock().map_err(|_| poisoned())?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self.failures.lock().map_err(|_| poisoned())?.remove(&op);
        if let Some(error) = injected {
            debug!(?op, vm = %name, error = %error, "Injected failure");
            return Err(error);
        }

        Ok(guard)
    }

    fn with_vm<T>(&self, name: &str, f: impl FnOnce(&mut MockVm) -> Result<T>) -> Result<T> {
        let mut vms = self.vms.write().map_err(|_| poisoned())?;
        let vm = vms
            .get_mut(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
        f(vm)
    }

    fn peer(&self, uri: &str) -> Result<Arc<MockBackend>> {
        let unreachable = || HypervisorError::MigrationFailed(format!("{} is unreachable", uri));
        if uri == self.uri {
            return Err(HypervisorError::MigrationFailed(
                "destination is this host".to_string(),
            ));
        }
        let hosts = self.peers.upgrade().ok_or_else(unreachable)?;
        let peer = hosts.lock().map_err(|_| poisoned())?.get(uri).cloned();
        peer.ok_or_else(unreachable)
    }

    /// Take over a guest arriving from another host.
    fn accept_guest(&self, name: &str, state: VmState, boots: u64) -> Result<()> {
        self.ensure_connected()?;
        self.with_vm(name, |vm| {
            if vm.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "domain is already active".to_string(),
                ));
            }
            vm.state = state;
            vm.boots = boots;
            Ok(())
        })
        .map_err(|e| match e {
            HypervisorError::VmNotFound(_) => HypervisorError::MigrationFailed(format!(
                "no definition for '{}' on {}",
                name, self.uri
            )),
            other => other,
        })
    }

    fn name_taken(&self, name: &str) -> Result<bool> {
        let defined = self.vms.read().map_err(|_| poisoned())?.contains_key(name);
        let staged = self.incoming.read().map_err(|_| poisoned())?.contains_key(name);
        Ok(defined || staged)
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        self.ensure_connected()?;
        Ok(HypervisorCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            supports_live_migration: true,
            supports_snapshots: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    #[instrument(skip(self, config), fields(vm = %config.name))]
    async fn create_vm(&self, mut config: VmConfig) -> Result<VmInfo> {
        let _call = self.begin(MockOp::Create, &config.name).await?;
        info!("Creating mock VM");

        if config.name.is_empty() {
            return Err(HypervisorError::InvalidConfig("VM name is empty".to_string()));
        }
        if self.name_taken(&config.name)? {
            return Err(HypervisorError::VmAlreadyExists(config.name));
        }
        if config.disk.path.is_empty() {
            config.disk.path = format!("{}/{}.qcow2", MOCK_STORAGE_PATH, config.name);
        }

        let vm = MockVm::defined(config);
        let info = vm.info();

        self.vms
            .write()
            .map_err(|_| poisoned())?
            .insert(info.name.clone(), vm);

        info!("Mock VM created");
        Ok(info)
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn start_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Start, name).await?;

        self.with_vm(name, |vm| {
            if vm.state != VmState::Inactive {
                return Err(HypervisorError::InvalidState(
                    "domain is already active".to_string(),
                ));
            }
            vm.state = VmState::Running;
            vm.boots += 1;
            Ok(())
        })?;

        info!("Mock VM started");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn stop_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Stop, name).await?;

        self.with_vm(name, |vm| {
            if vm.state == VmState::Inactive {
                return Err(HypervisorError::InvalidState(
                    "domain is not running".to_string(),
                ));
            }
            vm.state = VmState::Inactive;
            Ok(())
        })?;

        info!("Mock VM stopped");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn pause_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Pause, name).await?;

        self.with_vm(name, |vm| {
            if vm.state != VmState::Running {
                return Err(HypervisorError::InvalidState("VM is not running".to_string()));
            }
            vm.state = VmState::Paused;
            Ok(())
        })?;

        info!("Mock VM paused");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn resume_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Resume, name).await?;

        self.with_vm(name, |vm| {
            if vm.state != VmState::Paused {
                return Err(HypervisorError::InvalidState("VM is not paused".to_string()));
            }
            vm.state = VmState::Running;
            Ok(())
        })?;

        info!("Mock VM resumed");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn delete_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Delete, name).await?;

        let mut vms = self.vms.write().map_err(|_| poisoned())?;
        let vm = vms
            .get(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        if vm.state.is_active() {
            return Err(HypervisorError::DeleteFailed(
                "VM must be stopped before deletion".to_string(),
            ));
        }

        vms.remove(name);
        drop(vms);

        self.snapshots.write().map_err(|_| poisoned())?.remove(name);

        info!("Mock VM deleted");
        Ok(())
    }

    async fn get_vm_state(&self, name: &str) -> Result<VmState> {
        self.ensure_connected()?;
        let vms = self.vms.read().map_err(|_| poisoned())?;
        vms.get(name)
            .map(|vm| vm.state)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    async fn get_vm(&self, name: &str) -> Result<VmInfo> {
        self.ensure_connected()?;
        let vms = self.vms.read().map_err(|_| poisoned())?;
        vms.get(name)
            .map(MockVm::info)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        self.ensure_connected()?;
        let vms = self.vms.read().map_err(|_| poisoned())?;
        let result: Vec<VmInfo> = vms.values().map(MockVm::info).collect();

        debug!(count = result.len(), "Listed VMs");
        Ok(result)
    }

    async fn vm_exists(&self, name: &str) -> Result<bool> {
        self.ensure_connected()?;
        self.name_taken(name)
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn open_console(&self, name: &str) -> Result<ConsoleInfo> {
        let _call = self.begin(MockOp::Console, name).await?;

        let vms = self.vms.read().map_err(|_| poisoned())?;
        let index = vms
            .keys()
            .position(|n| n == name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        Ok(ConsoleInfo {
            host: "127.0.0.1".to_string(),
            port: 5900 + index as u16,
            viewer_launched: false,
        })
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        include_memory: bool,
    ) -> Result<SnapshotInfo> {
        let _call = self.begin(MockOp::CreateSnapshot, name).await?;

        if !self.vms.read().map_err(|_| poisoned())?.contains_key(name) {
            return Err(HypervisorError::VmNotFound(name.to_string()));
        }

        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        let list = snapshots.entry(name.to_string()).or_default();

        if list.iter().any(|s| s.name == snapshot) {
            return Err(HypervisorError::SnapshotAlreadyExists(snapshot.to_string()));
        }

        let info = SnapshotInfo {
            name: snapshot.to_string(),
            created_at: chrono::Utc::now(),
            kind: if include_memory {
                SnapshotKind::DiskAndMemory
            } else {
                SnapshotKind::DiskOnly
            },
        };
        list.push(info.clone());

        info!(kind = ?info.kind, "Snapshot created");
        Ok(info)
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotInfo>> {
        self.ensure_connected()?;

        if !self.vms.read().map_err(|_| poisoned())?.contains_key(name) {
            return Err(HypervisorError::VmNotFound(name.to_string()));
        }

        let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(snapshots.get(name).cloned().unwrap_or_default())
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn revert_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let _call = self.begin(MockOp::RevertSnapshot, name).await?;

        // Release the snapshot lock before taking the VM lock
        let kind = {
            let snapshots = self.snapshots.read().map_err(|_| poisoned())?;
            snapshots
                .get(name)
                .and_then(|list| list.iter().find(|s| s.name == snapshot))
                .map(|s| s.kind)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(snapshot.to_string()))?
        };

        self.with_vm(name, |vm| {
            vm.state = kind.restored_state();
            Ok(())
        })?;

        info!("Reverted to snapshot");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name, snapshot = %snapshot))]
    async fn delete_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let _call = self.begin(MockOp::DeleteSnapshot, name).await?;

        let mut snapshots = self.snapshots.write().map_err(|_| poisoned())?;
        let list = snapshots
            .get_mut(name)
            .ok_or_else(|| HypervisorError::SnapshotNotFound(snapshot.to_string()))?;

        let idx = list
            .iter()
            .position(|s| s.name == snapshot)
            .ok_or_else(|| HypervisorError::SnapshotNotFound(snapshot.to_string()))?;
        list.remove(idx);

        info!("Snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(source = %source, target = %target))]
    async fn clone_vm(&self, source: &str, target: &str) -> Result<VmInfo> {
        let _call = self.begin(MockOp::Clone, source).await?;

        if self.name_taken(target)? {
            return Err(HypervisorError::VmAlreadyExists(target.to_string()));
        }

        let mut vms = self.vms.write().map_err(|_| poisoned())?;
        let src = vms
            .get(source)
            .ok_or_else(|| HypervisorError::VmNotFound(source.to_string()))?;

        if src.state.is_active() {
            return Err(HypervisorError::InvalidState(
                "cannot copy the disk of an active VM".to_string(),
            ));
        }

        let mut config = src.config.clone();
        config.name = target.to_string();
        config.disk.path = format!("{}/{}.qcow2", MOCK_STORAGE_PATH, target);

        let vm = MockVm::defined(config);
        let info = vm.info();
        vms.insert(target.to_string(), vm);

        info!("Mock VM cloned");
        Ok(info)
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn export_vm(&self, name: &str) -> Result<VmDefinition> {
        let _call = self.begin(MockOp::Export, name).await?;

        let vms = self.vms.read().map_err(|_| poisoned())?;
        let vm = vms
            .get(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        Ok(VmDefinition {
            name: name.to_string(),
            state: vm.state,
            document: DomainXmlBuilder::new(&vm.config).build(),
            config: vm.config.clone(),
        })
    }

    #[instrument(skip(self, definition), fields(vm = %definition.name))]
    async fn prepare_incoming(&self, definition: &VmDefinition) -> Result<()> {
        let _call = self.begin(MockOp::PrepareIncoming, &definition.name).await?;

        if self.name_taken(&definition.name)? {
            return Err(HypervisorError::VmAlreadyExists(definition.name.clone()));
        }

        self.incoming
            .write()
            .map_err(|_| poisoned())?
            .insert(definition.name.clone(), MockVm::defined(definition.config.clone()));

        info!("Incoming VM staged");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn confirm_incoming(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::ConfirmIncoming, name).await?;

        let delay = *self.confirm_delay.lock().map_err(|_| poisoned())?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let vm = self
            .incoming
            .write()
            .map_err(|_| poisoned())?
            .remove(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        self.vms
            .write()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), vm);

        info!("Incoming VM confirmed");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn abort_incoming(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::AbortIncoming, name).await?;

        let staged = self.incoming.write().map_err(|_| poisoned())?.remove(name);
        if staged.is_none() {
            let mut vms = self.vms.write().map_err(|_| poisoned())?;
            if vms.get(name).map(|vm| vm.state) == Some(VmState::Inactive) {
                vms.remove(name);
            }
        }

        info!("Incoming VM discarded");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name, dest = %dest_uri))]
    async fn migrate_live(&self, name: &str, dest_uri: &str) -> Result<()> {
        let _call = self.begin(MockOp::MigrateLive, name).await?;
        let peer = self.peer(dest_uri)?;

        let (state, boots) = {
            let vms = self.vms.read().map_err(|_| poisoned())?;
            let vm = vms
                .get(name)
                .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
            if !vm.state.is_active() {
                return Err(HypervisorError::InvalidState(
                    "domain is not running".to_string(),
                ));
            }
            (vm.state, vm.boots)
        };

        // Hosts are locked one after the other, never both at once
        peer.accept_guest(name, state, boots)?;
        self.with_vm(name, |vm| {
            vm.state = VmState::Inactive;
            Ok(())
        })?;

        info!(state = %state, "Guest transferred");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    async fn release_vm(&self, name: &str) -> Result<()> {
        let _call = self.begin(MockOp::Release, name).await?;

        let mut vms = self.vms.write().map_err(|_| poisoned())?;
        let vm = vms
            .get(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        if vm.state.is_active() {
            return Err(HypervisorError::InvalidState(
                "VM must be stopped before release".to_string(),
            ));
        }

        vms.remove(name);
        drop(vms);
        self.snapshots.write().map_err(|_| poisoned())?.remove(name);

        info!("VM definition released");
        Ok(())
    }
}

/// Connector handing out [`MockBackend`] sessions.
///
/// Each URI maps to one simulated host whose VMs survive reconnects, so a
/// dropped session can be reopened without losing state.
pub struct MockConnector {
    hosts: Arc<HostMap>,
    unreachable: Mutex<HashSet<String>>,
    open_latency: Mutex<Duration>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(Mutex::new(HashMap::new())),
            unreachable: Mutex::new(HashSet::new()),
            open_latency: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
        }
    }

    /// The simulated host behind `uri`, created on first use.
    pub fn host(&self, uri: &str) -> Arc<MockBackend> {
        let mut hosts = match self.hosts.lock() {
            Ok(hosts) => hosts,
            Err(poisoned) => poisoned.into_inner(),
        };
        hosts
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MockBackend::with_peers(uri, Arc::downgrade(&self.hosts))))
            .clone()
    }

    /// Refuse (or allow again) connections to `uri`.
    pub fn set_unreachable(&self, uri: &str, unreachable: bool) {
        if let Ok(mut set) = self.unreachable.lock() {
            if unreachable {
                set.insert(uri.to_string());
            } else {
                set.remove(uri);
            }
        }
    }

    /// Make each `open` take this long.
    pub fn set_open_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.open_latency.lock() {
            *current = latency;
        }
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn Hypervisor>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let latency = *self.open_latency.lock().map_err(|_| poisoned())?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let unreachable = self
            .unreachable
            .lock()
            .map_err(|_| poisoned())?
            .contains(uri);
        if unreachable {
            return Err(HypervisorError::ConnectionFailed(format!(
                "{} is unreachable",
                uri
            )));
        }

        let host = self.host(uri);
        host.reconnect();
        debug!(uri = %uri, "Mock session opened");
        Ok(host as Arc<dyn Hypervisor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "mock:///host-a";

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let backend = MockBackend::new(URI);

        // Create
        let info = backend.create_vm(VmConfig::new("lifecycle-test")).await.unwrap();
        assert_eq!(info.state, VmState::Inactive);
        assert_eq!(info.storage_path, format!("{}/lifecycle-test.qcow2", MOCK_STORAGE_PATH));

        // Start
        backend.start_vm("lifecycle-test").await.unwrap();
        assert_eq!(backend.get_vm_state("lifecycle-test").await.unwrap(), VmState::Running);

        // Pause
        backend.pause_vm("lifecycle-test").await.unwrap();
        assert_eq!(backend.get_vm_state("lifecycle-test").await.unwrap(), VmState::Paused);

        // Resume
        backend.resume_vm("lifecycle-test").await.unwrap();
        assert_eq!(backend.get_vm_state("lifecycle-test").await.unwrap(), VmState::Running);

        // Stop
        backend.stop_vm("lifecycle-test").await.unwrap();
        assert_eq!(backend.get_vm_state("lifecycle-test").await.unwrap(), VmState::Inactive);

        // Delete
        backend.delete_vm("lifecycle-test").await.unwrap();
        assert!(!backend.vm_exists("lifecycle-test").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_running_vm_rejected() {
        let backend = MockBackend::new(URI);
        backend.create_vm(VmConfig::new("busy")).await.unwrap();
        backend.start_vm("busy").await.unwrap();

        let err = backend.delete_vm("busy").await.unwrap_err();
        assert!(matches!(err, HypervisorError::DeleteFailed(_)));
    }

    #[tokio::test]
    async fn test_snapshots() {
        let backend = MockBackend::new(URI);
        backend.create_vm(VmConfig::new("snapshot-test")).await.unwrap();
        backend.start_vm("snapshot-test").await.unwrap();

        let snapshot = backend.create_snapshot("snapshot-test", "snap1", true).await.unwrap();
        assert_eq!(snapshot.kind, SnapshotKind::DiskAndMemory);

        let err = backend.create_snapshot("snapshot-test", "snap1", true).await.unwrap_err();
        assert!(matches!(err, HypervisorError::SnapshotAlreadyExists(_)));

        backend.stop_vm("snapshot-test").await.unwrap();
        backend.revert_snapshot("snapshot-test", "snap1").await.unwrap();
        assert_eq!(backend.get_vm_state("snapshot-test").await.unwrap(), VmState::Running);

        backend.delete_snapshot("snapshot-test", "snap1").await.unwrap();
        assert!(backend.list_snapshots("snapshot-test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let backend = MockBackend::new(URI);
        backend.create_vm(VmConfig::new("flaky")).await.unwrap();
        backend.fail_next(MockOp::Start, HypervisorError::StartFailed("boom".to_string()));

        assert!(backend.start_vm("flaky").await.is_err());
        assert_eq!(backend.get_vm_state("flaky").await.unwrap(), VmState::Inactive);

        backend.start_vm("flaky").await.unwrap();
        assert_eq!(backend.call_count(MockOp::Start), 2);
    }

    #[tokio::test]
    async fn test_incoming_vm_hidden_until_confirmed() {
        let source = MockBackend::new(URI);
        let dest = MockBackend::new("mock:///host-b");
        source.create_vm(VmConfig::new("mover")).await.unwrap();

        let definition = source.export_vm("mover").await.unwrap();
        assert!(definition.document.contains("<name>mover</name>"));

        dest.prepare_incoming(&definition).await.unwrap();
        assert!(dest.has_incoming("mover"));
        assert!(dest.list_vms().await.unwrap().is_empty());

        dest.confirm_incoming("mover").await.unwrap();
        assert_eq!(dest.get_vm_state("mover").await.unwrap(), VmState::Inactive);
    }

    #[tokio::test]
    async fn test_live_migration_keeps_guest_running() {
        let connector = MockConnector::new();
        let source = connector.host(URI);
        let dest = connector.host("mock:///host-b");

        source.create_vm(VmConfig::new("mover")).await.unwrap();
        source.start_vm("mover").await.unwrap();
        source.pause_vm("mover").await.unwrap();

        let definition = source.export_vm("mover").await.unwrap();
        dest.prepare_incoming(&definition).await.unwrap();
        dest.confirm_incoming("mover").await.unwrap();

        source.migrate_live("mover", "mock:///host-b").await.unwrap();
        assert_eq!(source.get_vm_state("mover").await.unwrap(), VmState::Inactive);
        assert_eq!(dest.get_vm_state("mover").await.unwrap(), VmState::Paused);
        assert_eq!(dest.boot_count("mover"), Some(1));
        assert_eq!(dest.call_count(MockOp::Start), 0);
    }

    #[tokio::test]
    async fn test_live_migration_needs_destination_definition() {
        let connector = MockConnector::new();
        let source = connector.host(URI);
        connector.host("mock:///host-b");

        source.create_vm(VmConfig::new("mover")).await.unwrap();
        source.start_vm("mover").await.unwrap();

        let err = source.migrate_live("mover", "mock:///host-b").await.unwrap_err();
        assert!(matches!(err, HypervisorError::MigrationFailed(_)));
        assert_eq!(source.get_vm_state("mover").await.unwrap(), VmState::Running);

        let err = source.migrate_live("mover", "mock:///nowhere").await.unwrap_err();
        assert!(matches!(err, HypervisorError::MigrationFailed(_)));
    }

    #[tokio::test]
    async fn test_connector_reuses_host_state() {
        let connector = MockConnector::new();
        let first = connector.open(URI).await.unwrap();
        first.create_vm(VmConfig::new("persistent")).await.unwrap();

        connector.host(URI).disconnect();
        assert!(!first.health_check().await.unwrap());

        let second = connector.open(URI).await.unwrap();
        assert!(second.vm_exists("persistent").await.unwrap());
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_connector_unreachable() {
        let connector = MockConnector::new();
        connector.set_unreachable(URI, true);

        let err = connector.open(URI).await.err().unwrap();
        assert!(err.is_connection_error());
    }
}
