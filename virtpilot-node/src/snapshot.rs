//! Snapshot and clone operations.
//!
//! Snapshots are driver-managed, named per VM. Every operation here runs
//! under the VM's dispatcher lock, so a snapshot never races a lifecycle
//! call on the same VM. Clones lock both the source and the destination
//! name for the whole copy.

use std::sync::Arc;
use tracing::{info, instrument};
use virtpilot_hypervisor::{HypervisorError, SnapshotInfo, VmInfo, VmState};

use crate::dispatcher::{Dispatcher, VmGuard};
use crate::error::{ControlError, Result};

/// Snapshot and clone operations on top of the dispatcher.
pub struct SnapshotService {
    dispatcher: Arc<Dispatcher>,
}

fn validate_snapshot_name(snapshot: &str) -> Result<()> {
    if snapshot.trim().is_empty() {
        return Err(ControlError::InvalidRequest(
            "snapshot name is required".to_string(),
        ));
    }
    if snapshot.contains('/') || snapshot.chars().any(char::is_whitespace) {
        return Err(ControlError::InvalidRequest(format!(
            "snapshot name '{}' may not contain '/' or whitespace",
            snapshot
        )));
    }
    Ok(())
}

async fn find_snapshot(guard: &VmGuard, snapshot: &str) -> Result<Option<SnapshotInfo>> {
    let snapshots = guard
        .run(guard.hypervisor().list_snapshots(guard.name()))
        .await?;
    Ok(snapshots.into_iter().find(|s| s.name == snapshot))
}

impl SnapshotService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Capture the VM's disk, plus memory when the guest is active.
    #[instrument(skip_all, fields(uri = %uri, vm = %name, snapshot = %snapshot))]
    pub async fn create(&self, uri: &str, name: &str, snapshot: &str) -> Result<SnapshotInfo> {
        validate_snapshot_name(snapshot)?;

        let mut guard = self.dispatcher.lock_vm(uri, name).await?;
        let state = guard.current_state().await?;

        if find_snapshot(&guard, snapshot).await?.is_some() {
            return Err(ControlError::DuplicateSnapshot {
                vm: name.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        let include_memory = state.is_active();
        let info = guard
            .run(guard.hypervisor().create_snapshot(name, snapshot, include_memory))
            .await?;
        guard.record(Some(state));

        info!(kind = ?info.kind, "Snapshot created");
        Ok(info)
    }

    /// Snapshot names in creation order. A VM without snapshots yields an
    /// empty list.
    pub async fn list(&self, uri: &str, name: &str) -> Result<Vec<SnapshotInfo>> {
        let guard = self.dispatcher.lock_vm(uri, name).await?;
        guard
            .run(guard.hypervisor().list_snapshots(name))
            .await
    }

    /// Restore the VM to a snapshot. The VM ends up running if the snapshot
    /// captured memory, inactive otherwise.
    #[instrument(skip_all, fields(uri = %uri, vm = %name, snapshot = %snapshot))]
    pub async fn revert(&self, uri: &str, name: &str, snapshot: &str) -> Result<VmState> {
        let mut guard = self.dispatcher.lock_vm(uri, name).await?;

        let target = find_snapshot(&guard, snapshot)
            .await?
            .ok_or_else(|| ControlError::SnapshotNotFound {
                vm: name.to_string(),
                snapshot: snapshot.to_string(),
            })?;

        guard
            .run(guard.hypervisor().revert_snapshot(name, snapshot))
            .await?;
        guard.commit(target.kind.restored_state()).await;

        let state = guard.recorded().unwrap_or(target.kind.restored_state());
        info!(state = %state, "Reverted to snapshot");
        Ok(state)
    }

    #[instrument(skip_all, fields(uri = %uri, vm = %name, snapshot = %snapshot))]
    pub async fn delete(&self, uri: &str, name: &str, snapshot: &str) -> Result<()> {
        let guard = self.dispatcher.lock_vm(uri, name).await?;

        if find_snapshot(&guard, snapshot).await?.is_none() {
            return Err(ControlError::SnapshotNotFound {
                vm: name.to_string(),
                snapshot: snapshot.to_string(),
            });
        }

        guard
            .run(guard.hypervisor().delete_snapshot(name, snapshot))
            .await?;

        info!("Snapshot deleted");
        Ok(())
    }

    /// Copy an inactive VM's storage and definition to a new name on the
    /// same hypervisor. The copy is left inactive.
    #[instrument(skip_all, fields(uri = %uri, source = %source, target = %target))]
    pub async fn clone_vm(&self, uri: &str, source: &str, target: &str) -> Result<VmInfo> {
        if target.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "destination name is required".to_string(),
            ));
        }
        if source == target {
            return Err(ControlError::NameCollision {
                name: target.to_string(),
                uri: uri.to_string(),
            });
        }

        let guards = self
            .dispatcher
            .lock_all(&[(uri, source), (uri, target)])
            .await?;
        let [mut src, mut dst]: [VmGuard; 2] = guards
            .try_into()
            .map_err(|_| ControlError::Driver("expected two VM locks".to_string()))?;
        let hv = src.hypervisor();

        let state = match hv.get_vm_state(source).await {
            Ok(state) => state,
            Err(HypervisorError::VmNotFound(_)) => {
                return Err(ControlError::SourceNotFound(source.to_string()))
            }
            Err(e) => return Err(src.fail(e).await),
        };

        if dst.run(hv.vm_exists(target)).await? {
            return Err(ControlError::NameCollision {
                name: target.to_string(),
                uri: uri.to_string(),
            });
        }

        if state != VmState::Inactive {
            return Err(ControlError::InvalidState {
                name: source.to_string(),
                state,
                reason: "stop it before cloning".to_string(),
            });
        }

        let info = src.run(hv.clone_vm(source, target)).await?;
        src.record(Some(state));
        dst.record(Some(info.state));

        info!(path = %info.storage_path, "VM cloned");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::dispatcher::{ProvisioningDefaults, VmSpec};
    use virtpilot_hypervisor::{MockConnector, MockOp, SnapshotKind};

    const URI: &str = "qemu:///system";

    async fn setup() -> (Arc<MockConnector>, Arc<Dispatcher>, SnapshotService) {
        let connector = Arc::new(MockConnector::new());
        let connections = Arc::new(ConnectionManager::new(connector.clone()));
        let dispatcher = Arc::new(Dispatcher::new(connections, ProvisioningDefaults::default()));

        dispatcher
            .create(
                URI,
                VmSpec {
                    name: "web1".to_string(),
                    ram_mib: 1024,
                    vcpus: 1,
                    disk_gib: 10,
                    iso: None,
                    os_variant: None,
                },
            )
            .await
            .unwrap();

        let snapshots = SnapshotService::new(dispatcher.clone());
        (connector, dispatcher, snapshots)
    }

    #[tokio::test]
    async fn test_snapshot_kind_follows_state() {
        let (_connector, dispatcher, snapshots) = setup().await;

        let cold = snapshots.create(URI, "web1", "cold").await.unwrap();
        assert_eq!(cold.kind, SnapshotKind::DiskOnly);

        dispatcher.start(URI, "web1").await.unwrap();
        let live = snapshots.create(URI, "web1", "live").await.unwrap();
        assert_eq!(live.kind, SnapshotKind::DiskAndMemory);

        let names: Vec<String> = snapshots
            .list(URI, "web1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["cold", "live"]);
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_rejected() {
        let (connector, _dispatcher, snapshots) = setup().await;

        snapshots.create(URI, "web1", "s1").await.unwrap();
        let err = snapshots.create(URI, "web1", "s1").await.unwrap_err();
        assert_eq!(err.kind(), "duplicate_snapshot");
        assert_eq!(connector.host(URI).call_count(MockOp::CreateSnapshot), 1);
    }

    #[tokio::test]
    async fn test_revert_restores_state_of_snapshot() {
        let (_connector, dispatcher, snapshots) = setup().await;

        dispatcher.start(URI, "web1").await.unwrap();
        snapshots.create(URI, "web1", "live").await.unwrap();
        dispatcher.stop(URI, "web1").await.unwrap();

        let state = snapshots.revert(URI, "web1", "live").await.unwrap();
        assert_eq!(state, VmState::Running);
        assert_eq!(dispatcher.recorded_state(URI, "web1").await, Some(VmState::Running));
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let (_connector, _dispatcher, snapshots) = setup().await;

        let err = snapshots.revert(URI, "web1", "nope").await.unwrap_err();
        assert_eq!(err.kind(), "snapshot_not_found");
        let err = snapshots.delete(URI, "web1", "nope").await.unwrap_err();
        assert_eq!(err.kind(), "snapshot_not_found");
        assert!(snapshots.list(URI, "web1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_rules() {
        let (_connector, dispatcher, snapshots) = setup().await;

        let err = snapshots.clone_vm(URI, "ghost", "copy").await.unwrap_err();
        assert_eq!(err.kind(), "source_not_found");

        let err = snapshots.clone_vm(URI, "web1", "web1").await.unwrap_err();
        assert_eq!(err.kind(), "name_collision");

        dispatcher.start(URI, "web1").await.unwrap();
        let err = snapshots.clone_vm(URI, "web1", "copy").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert!(dispatcher.list_vms(URI).await.unwrap().iter().all(|vm| vm.name != "copy"));

        dispatcher.stop(URI, "web1").await.unwrap();
        let copy = snapshots.clone_vm(URI, "web1", "copy").await.unwrap();
        assert_eq!(copy.state, VmState::Inactive);
        assert!(copy.storage_path.ends_with("copy.qcow2"));

        let err = snapshots.clone_vm(URI, "web1", "copy").await.unwrap_err();
        assert_eq!(err.kind(), "name_collision");
    }
}
