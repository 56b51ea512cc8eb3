//! Command Dispatcher - serialized, validated VM operations.
//!
//! Every operation that targets a VM first takes that VM's slot in a keyed
//! lock table. Slots are keyed by (hypervisor URI, VM name), created on first
//! use and never removed; the table itself sits behind one map-level lock
//! that is only held while looking a slot up. Operations on different VMs
//! run in parallel, operations on the same VM run one at a time.
//!
//! With the slot held, the dispatcher reads the VM's live state, validates
//! the requested action against the transition table, calls the driver and
//! records the resulting state before the slot is released. Driver errors
//! are normalized into [`ControlError`] on the way out; a connection error
//! also invalidates the cached session so the next caller reconnects.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};
use virtpilot_hypervisor::{
    ConsoleInfo, Hypervisor, HypervisorCapabilities, HypervisorError, VmConfig, VmInfo, VmState,
};

use crate::connection::{Connection, ConnectionManager};
use crate::error::{ControlError, Result};
use crate::state_machine::{self, Action, Outcome};

/// Lock table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmKey {
    pub uri: String,
    pub name: String,
}

/// Per-VM slot contents.
#[derive(Debug, Default)]
pub struct VmSlot {
    /// State committed by the last completed operation
    recorded: Option<VmState>,
}

/// Exclusive access to one VM, plus the session to reach it.
pub struct VmGuard {
    key: VmKey,
    conn: Connection,
    connections: Arc<ConnectionManager>,
    slot: OwnedMutexGuard<VmSlot>,
}

impl VmGuard {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn uri(&self) -> &str {
        &self.key.uri
    }

    pub fn hypervisor(&self) -> Arc<dyn Hypervisor> {
        self.conn.hypervisor().clone()
    }

    /// Normalize a driver error for this VM.
    pub async fn fail(&self, err: HypervisorError) -> ControlError {
        if err.is_connection_error() {
            self.connections.invalidate(&self.conn).await;
        }
        ControlError::from_driver(err, self.uri(), self.name())
    }

    /// Await a driver call, normalizing its error.
    pub async fn run<T>(
        &self,
        call: impl Future<Output = virtpilot_hypervisor::error::Result<T>>,
    ) -> Result<T> {
        match call.await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Live state from the hypervisor.
    ///
    /// A read is safe to repeat, so a lost session is reopened and the
    /// query retried once before the error surfaces.
    pub async fn current_state(&mut self) -> Result<VmState> {
        match self.conn.hypervisor().get_vm_state(&self.key.name).await {
            Ok(state) => Ok(state),
            Err(e) if e.is_connection_error() => {
                warn!(vm = %self.key.name, error = %e, "Session lost, reconnecting");
                self.connections.invalidate(&self.conn).await;
                self.conn = self.connections.acquire(&self.key.uri).await?;
                self.run(self.conn.hypervisor().get_vm_state(&self.key.name))
                    .await
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Record `state` without asking the hypervisor.
    pub fn record(&mut self, state: Option<VmState>) {
        self.slot.recorded = state;
    }

    /// Record the state after a successful mutation, checking it against
    /// what the hypervisor now reports.
    pub async fn commit(&mut self, expected: VmState) {
        let observed = match self.conn.hypervisor().get_vm_state(&self.key.name).await {
            Ok(state) => state,
            Err(e) => {
                warn!(vm = %self.key.name, error = %e, "Could not confirm state after operation");
                if e.is_connection_error() {
                    self.connections.invalidate(&self.conn).await;
                }
                expected
            }
        };

        if observed != expected {
            warn!(
                vm = %self.key.name,
                expected = %expected,
                observed = %observed,
                "Hypervisor reports a different state than the transition target"
            );
        }
        self.slot.recorded = Some(observed);
    }

    pub fn recorded(&self) -> Option<VmState> {
        self.slot.recorded
    }
}

/// Parameters of a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub ram_mib: u64,
    pub vcpus: u32,
    pub disk_gib: u64,
    /// ISO filename from the catalog, or an absolute path
    pub iso: Option<String>,
    pub os_variant: Option<String>,
}

impl VmSpec {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ControlError::InvalidRequest("VM name is required".to_string()));
        }
        if self.ram_mib == 0 {
            return Err(ControlError::InvalidRequest("ram must be greater than zero".to_string()));
        }
        if self.vcpus == 0 {
            return Err(ControlError::InvalidRequest("cpu must be greater than zero".to_string()));
        }
        if self.disk_gib == 0 {
            return Err(ControlError::InvalidRequest("disk must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Host-wide defaults applied to new VMs.
#[derive(Debug, Clone)]
pub struct ProvisioningDefaults {
    /// Directory relative ISO names are resolved against
    pub iso_dir: PathBuf,
    /// Bridge for the VM's NIC
    pub bridge: String,
}

impl Default for ProvisioningDefaults {
    fn default() -> Self {
        Self {
            iso_dir: PathBuf::from("/var/lib/libvirt/images"),
            bridge: "br0".to_string(),
        }
    }
}

/// Serializes and validates VM operations.
pub struct Dispatcher {
    connections: Arc<ConnectionManager>,
    locks: Mutex<HashMap<VmKey, Arc<tokio::sync::Mutex<VmSlot>>>>,
    defaults: ProvisioningDefaults,
}

impl Dispatcher {
    pub fn new(connections: Arc<ConnectionManager>, defaults: ProvisioningDefaults) -> Self {
        Self {
            connections,
            locks: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn slot(&self, key: &VmKey) -> Result<Arc<tokio::sync::Mutex<VmSlot>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| ControlError::Driver("VM lock table poisoned".to_string()))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Take exclusive access to one VM.
    pub async fn lock_vm(&self, uri: &str, name: &str) -> Result<VmGuard> {
        self.lock_all(&[(uri, name)])
            .await?
            .pop()
            .ok_or_else(|| ControlError::Driver("lock acquisition returned nothing".to_string()))
    }

    /// Take exclusive access to several VMs at once.
    ///
    /// Slots are always locked in key order so two multi-VM operations can
    /// never deadlock each other. Guards come back in the order requested.
    pub async fn lock_all(&self, targets: &[(&str, &str)]) -> Result<Vec<VmGuard>> {
        let keys: Vec<VmKey> = targets
            .iter()
            .map(|(uri, name)| VmKey {
                uri: uri.to_string(),
                name: name.to_string(),
            })
            .collect();

        if keys.iter().any(|k| k.name.trim().is_empty()) {
            return Err(ControlError::InvalidRequest("VM name is required".to_string()));
        }

        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
        if order.windows(2).any(|w| keys[w[0]] == keys[w[1]]) {
            return Err(ControlError::InvalidRequest(
                "the same VM cannot be both source and target".to_string(),
            ));
        }

        let mut slots: Vec<Option<OwnedMutexGuard<VmSlot>>> = keys.iter().map(|_| None).collect();
        for i in order {
            let slot = self.slot(&keys[i])?;
            slots[i] = Some(slot.lock_owned().await);
            debug!(uri = %keys[i].uri, vm = %keys[i].name, "VM lock acquired");
        }

        let mut guards = Vec::with_capacity(keys.len());
        for (key, slot) in keys.into_iter().zip(slots) {
            let slot = slot.ok_or_else(|| ControlError::Driver("VM slot not locked".to_string()))?;
            let conn = self.connections.acquire(&key.uri).await?;
            guards.push(VmGuard {
                key,
                conn,
                connections: self.connections.clone(),
                slot,
            });
        }
        Ok(guards)
    }

    /// Run a lifecycle action and return a human-readable result message.
    #[instrument(skip_all, fields(uri = %uri, vm = %name, action = %action))]
    pub async fn execute(&self, uri: &str, name: &str, action: Action) -> Result<String> {
        let mut guard = self.lock_vm(uri, name).await?;
        let state = guard.current_state().await?;
        let outcome = state_machine::validate(name, state, action)?;
        let hv = guard.hypervisor();

        let message = match (action, outcome) {
            (_, Outcome::Noop) => {
                guard.record(Some(state));
                return Ok(format!("VM '{}' is already stopped", name));
            }
            (Action::Restart, _) => return self.restart_locked(guard).await,
            (Action::Start, _) => {
                guard.run(hv.start_vm(name)).await?;
                format!("VM '{}' started", name)
            }
            (Action::Stop, _) => {
                guard.run(hv.stop_vm(name)).await?;
                format!("VM '{}' stopped", name)
            }
            (Action::Pause, _) => {
                guard.run(hv.pause_vm(name)).await?;
                format!("VM '{}' paused", name)
            }
            (Action::Resume, _) => {
                guard.run(hv.resume_vm(name)).await?;
                format!("VM '{}' resumed", name)
            }
            (Action::Delete, _) => {
                guard.run(hv.delete_vm(name)).await?;
                format!("VM '{}' deleted", name)
            }
            (Action::Console, _) => {
                let console = guard.run(hv.open_console(name)).await?;
                console_message(name, &console)
            }
        };

        match outcome {
            Outcome::Next(next) => guard.commit(next).await,
            Outcome::Removed => guard.record(None),
            Outcome::Unchanged | Outcome::Noop => {}
        }

        info!(state = ?guard.recorded(), "{}", message);
        Ok(message)
    }

    pub async fn start(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Start).await
    }

    pub async fn stop(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Stop).await
    }

    pub async fn pause(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Pause).await
    }

    pub async fn resume(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Resume).await
    }

    pub async fn restart(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Restart).await
    }

    pub async fn delete(&self, uri: &str, name: &str) -> Result<String> {
        self.execute(uri, name, Action::Delete).await
    }

    /// Stop then start under one lock hold.
    async fn restart_locked(&self, mut guard: VmGuard) -> Result<String> {
        let hv = guard.hypervisor();
        let name = guard.name().to_string();

        guard.run(hv.stop_vm(&name)).await?;
        guard.record(Some(VmState::Inactive));

        if let Err(e) = hv.start_vm(&name).await {
            let cause = guard.fail(e).await;
            warn!(vm = %name, error = %cause, "Restart stopped the VM but could not start it");
            return Err(ControlError::PartialFailure(format!(
                "VM '{}' was stopped but failed to start again, it is now inactive: {}",
                name, cause
            )));
        }

        guard.commit(VmState::Running).await;
        info!(vm = %name, "VM restarted");
        Ok(format!("VM '{}' restarted", name))
    }

    /// Open a console session for an active VM.
    #[instrument(skip_all, fields(uri = %uri, vm = %name))]
    pub async fn console(&self, uri: &str, name: &str) -> Result<(String, ConsoleInfo)> {
        let mut guard = self.lock_vm(uri, name).await?;
        let state = guard.current_state().await?;
        state_machine::validate(name, state, Action::Console)?;

        let console = guard.run(guard.hypervisor().open_console(name)).await?;
        let message = console_message(name, &console);

        info!(port = console.port, viewer = console.viewer_launched, "Console ready");
        Ok((message, console))
    }

    /// Provision a new VM. It is left inactive.
    #[instrument(skip_all, fields(uri = %uri, vm = %spec.name))]
    pub async fn create(&self, uri: &str, mut spec: VmSpec) -> Result<VmInfo> {
        spec.name = spec.name.trim().to_string();
        spec.validate()?;
        let config = self.build_config(&spec)?;

        let mut guard = self.lock_vm(uri, &spec.name).await?;
        let hv = guard.hypervisor();

        if guard.run(hv.vm_exists(&spec.name)).await? {
            return Err(ControlError::NameCollision {
                name: spec.name,
                uri: uri.to_string(),
            });
        }

        let info = guard.run(hv.create_vm(config)).await?;
        guard.record(Some(info.state));

        info!(
            memory_mib = info.memory_mib,
            vcpus = info.vcpus,
            disk_gib = info.disk_gib,
            path = %info.storage_path,
            "VM created"
        );
        Ok(info)
    }

    fn build_config(&self, spec: &VmSpec) -> Result<VmConfig> {
        let mut config = VmConfig::new(spec.name.as_str())
            .with_memory(spec.ram_mib)
            .with_cpu(spec.vcpus)
            .with_disk_size(spec.disk_gib)
            .with_bridge(self.defaults.bridge.clone());

        if let Some(iso) = spec.iso.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            config = config.with_iso(self.resolve_iso(iso)?);
        }
        if let Some(os) = spec.os_variant.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            config = config.with_os_variant(os);
        }
        Ok(config)
    }

    fn resolve_iso(&self, iso: &str) -> Result<String> {
        let path = Path::new(iso);
        if path.is_absolute() {
            return Ok(iso.to_string());
        }
        if path.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ControlError::InvalidRequest(format!(
                "ISO name '{}' must be a plain file name",
                iso
            )));
        }
        Ok(self.defaults.iso_dir.join(path).to_string_lossy().into_owned())
    }

    /// Live state of one VM, ordered after any in-flight operation on it.
    pub async fn state(&self, uri: &str, name: &str) -> Result<VmState> {
        let mut guard = self.lock_vm(uri, name).await?;
        let state = guard.current_state().await?;
        guard.record(Some(state));
        Ok(state)
    }

    /// Full record of one VM.
    pub async fn vm_info(&self, uri: &str, name: &str) -> Result<VmInfo> {
        let guard = self.lock_vm(uri, name).await?;
        guard.run(guard.hypervisor().get_vm(name)).await
    }

    /// All VMs at `uri`, straight from the hypervisor.
    pub async fn list_vms(&self, uri: &str) -> Result<Vec<VmInfo>> {
        let conn = self.connections.acquire(uri).await?;
        match conn.hypervisor().list_vms().await {
            Ok(vms) => Ok(vms),
            Err(e) => {
                if e.is_connection_error() {
                    self.connections.invalidate(&conn).await;
                }
                Err(ControlError::from_driver(e, uri, ""))
            }
        }
    }

    /// Driver identity of the hypervisor at `uri`.
    pub async fn health(&self, uri: &str) -> Result<HypervisorCapabilities> {
        let conn = self.connections.acquire(uri).await?;
        match conn.hypervisor().capabilities().await {
            Ok(caps) => Ok(caps),
            Err(e) => {
                if e.is_connection_error() {
                    self.connections.invalidate(&conn).await;
                }
                Err(ControlError::from_driver(e, uri, ""))
            }
        }
    }

    /// State committed by the last completed operation on a VM, if any.
    pub async fn recorded_state(&self, uri: &str, name: &str) -> Option<VmState> {
        let key = VmKey {
            uri: uri.to_string(),
            name: name.to_string(),
        };
        let slot = self.slot(&key).ok()?;
        let recorded = slot.lock().await.recorded;
        recorded
    }
}

fn console_message(name: &str, console: &ConsoleInfo) -> String {
    if console.viewer_launched {
        format!("Console opened for VM '{}' (VNC {}:{})", name, console.host, console.port)
    } else {
        format!("VM '{}' console available on VNC {}:{}", name, console.host, console.port)
    }
}
