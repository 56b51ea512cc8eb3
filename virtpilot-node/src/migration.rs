//! Migration Coordinator - moves a VM to another hypervisor URI.
//!
//! The protocol runs with the VM locked under its name on both the source
//! and the destination URI:
//!
//! 1. Pre-flight: the destination must not know a VM of that name.
//! 2. Transfer: export the source definition and stage it on the
//!    destination. A staged VM is invisible and cannot be started.
//! 3. Acknowledge: the destination confirms the staged VM, bounded by the
//!    acknowledgment timeout.
//! 4. Cut over. A running or paused VM in a live migration has its memory
//!    and execution moved to the destination copy, where the guest carries
//!    on in the same state without a reboot; the source definition is then
//!    released. Otherwise (offline migration, or an inactive VM) the source
//!    is powered off and released, and the destination copy stays inactive.
//!
//! Until step 3 succeeds the source is canonical and is never touched, so a
//! lost acknowledgment rolls back to exactly the state before the call. The
//! guest only moves once the destination holds a confirmed inactive copy,
//! and the driver hands execution over in one step, so the VM never runs
//! in two places.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use virtpilot_hypervisor::{Hypervisor, VmState};

use crate::dispatcher::{Dispatcher, VmGuard};
use crate::error::ControlError;

/// Default time to wait for the destination's acknowledgment.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Pending,
    InFlight,
    Committed,
    RolledBack,
    Failed,
}

/// A single migration, alive for the duration of the call.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub vm: String,
    pub source_uri: String,
    pub dest_uri: String,
    pub status: MigrationStatus,
    /// Whether an active VM keeps running across the move
    pub live: bool,
    /// Source state when the migration started
    pub source_state: Option<VmState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    fn new(vm: &str, source_uri: &str, dest_uri: &str, live: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            vm: vm.to_string(),
            source_uri: source_uri.to_string(),
            dest_uri: dest_uri.to_string(),
            status: MigrationStatus::Pending,
            live,
            source_state: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, status: MigrationStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// A migration that did not commit.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct MigrationFailure {
    /// Terminal job record (failed or rolled back)
    pub job: MigrationJob,
    pub error: ControlError,
}

impl MigrationFailure {
    fn new(mut job: MigrationJob, status: MigrationStatus, error: ControlError) -> Self {
        job.finish(status);
        Self { job, error }
    }
}

/// Drives migrations on top of the dispatcher's lock table.
pub struct MigrationCoordinator {
    dispatcher: Arc<Dispatcher>,
    ack_timeout: Duration,
    live: bool,
}

/// Best-effort removal of whatever was staged on the destination.
async fn discard_incoming(dest: &VmGuard) {
    if let Err(e) = dest.hypervisor().abort_incoming(dest.name()).await {
        warn!(uri = %dest.uri(), vm = %dest.name(), error = %e, "Could not discard incoming VM");
    }
}

impl MigrationCoordinator {
    pub fn new(dispatcher: Arc<Dispatcher>, ack_timeout: Duration, live: bool) -> Self {
        Self {
            dispatcher,
            ack_timeout,
            live,
        }
    }

    #[instrument(skip_all, fields(vm = %name, source = %uri, dest = %dest_uri))]
    pub async fn migrate(
        &self,
        uri: &str,
        name: &str,
        dest_uri: &str,
    ) -> std::result::Result<MigrationJob, MigrationFailure> {
        let mut job = MigrationJob::new(name, uri, dest_uri, self.live);

        if dest_uri.trim().is_empty() {
            let error = ControlError::InvalidRequest("destination URI is required".to_string());
            return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
        }
        if dest_uri == uri {
            let error = ControlError::InvalidRequest(
                "destination URI must differ from the source".to_string(),
            );
            return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
        }

        let guards = match self
            .dispatcher
            .lock_all(&[(uri, name), (dest_uri, name)])
            .await
        {
            Ok(guards) => guards,
            Err(error) => return Err(MigrationFailure::new(job, MigrationStatus::Failed, error)),
        };
        let [mut source, mut dest]: [VmGuard; 2] = match guards.try_into() {
            Ok(pair) => pair,
            Err(_) => {
                let error = ControlError::Driver("expected two VM locks".to_string());
                return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
            }
        };

        let state = match source.current_state().await {
            Ok(state) => state,
            Err(error) => return Err(MigrationFailure::new(job, MigrationStatus::Failed, error)),
        };
        job.source_state = Some(state);

        // 1. Pre-flight
        match dest.run(dest.hypervisor().vm_exists(name)).await {
            Ok(false) => {}
            Ok(true) => {
                let error = ControlError::NameCollision {
                    name: name.to_string(),
                    uri: dest_uri.to_string(),
                };
                return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
            }
            Err(error) => return Err(MigrationFailure::new(job, MigrationStatus::Failed, error)),
        }

        // 2. Transfer
        job.status = MigrationStatus::InFlight;
        info!(id = %job.id, state = %state, "Migration started");

        let src_hv = source.hypervisor();
        let dest_hv = dest.hypervisor();

        let definition = match source.run(src_hv.export_vm(name)).await {
            Ok(definition) => definition,
            Err(error) => {
                warn!(error = %error, "Export failed, source unchanged");
                return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
            }
        };

        if let Err(error) = dest.run(dest_hv.prepare_incoming(&definition)).await {
            warn!(error = %error, "Transfer failed, source unchanged");
            discard_incoming(&dest).await;
            return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
        }

        // 3. Acknowledge
        match tokio::time::timeout(self.ack_timeout, dest_hv.confirm_incoming(name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let error = dest.fail(e).await;
                warn!(error = %error, "Destination refused commit, rolling back");
                discard_incoming(&dest).await;
                source.record(Some(state));
                return Err(MigrationFailure::new(job, MigrationStatus::RolledBack, error));
            }
            Err(_) => {
                warn!(timeout = ?self.ack_timeout, "No acknowledgment from destination, rolling back");
                discard_incoming(&dest).await;
                source.record(Some(state));
                let error = ControlError::PartialFailure(format!(
                    "destination {} did not acknowledge within {:?}; VM '{}' remains on {}",
                    dest_uri, self.ack_timeout, name, uri
                ));
                return Err(MigrationFailure::new(job, MigrationStatus::RolledBack, error));
            }
        }
        dest.record(Some(VmState::Inactive));

        // 4. Cut over
        if self.live && state.is_active() {
            if let Err(error) = self.transfer_live(&mut source, dest_uri, state).await {
                discard_incoming(&dest).await;
                dest.record(None);
                return Err(MigrationFailure::new(job, MigrationStatus::RolledBack, error));
            }
            dest.commit(state).await;

            if let Err(error) = source.run(src_hv.release_vm(name)).await {
                source.record(Some(VmState::Inactive));
                error!(error = %error, "VM runs on destination but the source definition remains");
                let error = ControlError::PartialFailure(format!(
                    "VM '{}' now runs on {} but its inactive definition could not be removed from {}: {}",
                    name, dest_uri, uri, error
                ));
                return Err(MigrationFailure::new(job, MigrationStatus::Failed, error));
            }
        } else {
            if let Err(error) = self.cut_over(&mut source, &dest, state).await {
                discard_incoming(&dest).await;
                dest.record(None);
                return Err(MigrationFailure::new(job, MigrationStatus::RolledBack, error));
            }
            dest.commit(VmState::Inactive).await;
        }
        source.record(None);

        job.finish(MigrationStatus::Committed);
        info!(id = %job.id, final_state = ?dest.recorded(), "Migration committed");
        Ok(job)
    }

    /// Move the guest's memory and execution to the destination copy.
    ///
    /// The driver aborts a failed transfer with the guest still running on
    /// the source.
    async fn transfer_live(
        &self,
        source: &mut VmGuard,
        dest_uri: &str,
        state: VmState,
    ) -> crate::error::Result<()> {
        let hv = source.hypervisor();
        let name = source.name().to_string();

        if let Err(error) = source.run(hv.migrate_live(&name, dest_uri)).await {
            warn!(error = %error, "Live transfer failed, guest stays on source");
            source.commit(state).await;
            return Err(error);
        }

        info!(dest = %dest_uri, "Guest state transferred");
        Ok(())
    }

    /// Power the source off and hand its definition over.
    ///
    /// On error the source is left (or put back) in `state`.
    async fn cut_over(
        &self,
        source: &mut VmGuard,
        dest: &VmGuard,
        state: VmState,
    ) -> crate::error::Result<()> {
        let hv = source.hypervisor();
        let name = source.name().to_string();

        if state.is_active() {
            source.run(hv.stop_vm(&name)).await?;
        }

        if let Err(error) = source.run(hv.release_vm(&name)).await {
            warn!(error = %error, "Could not release source definition, restoring it");
            if state.is_active() {
                restore_state(&hv, &name, state).await;
            }
            source.commit(state).await;
            return Err(error);
        }

        info!(dest = %dest.uri(), "Source released");
        Ok(())
    }
}

async fn restore_state(hv: &Arc<dyn Hypervisor>, name: &str, state: VmState) {
    if let Err(e) = hv.start_vm(name).await {
        error!(vm = %name, error = %e, "Could not restart source after failed cut-over");
        return;
    }
    if state == VmState::Paused {
        if let Err(e) = hv.pause_vm(name).await {
            warn!(vm = %name, error = %e, "Could not re-pause source after failed cut-over");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::dispatcher::{ProvisioningDefaults, VmSpec};
    use virtpilot_hypervisor::{HypervisorError, MockConnector, MockOp};

    const SRC: &str = "qemu+ssh://node-a/system";
    const DST: &str = "qemu+ssh://node-b/system";

    async fn setup(ack_timeout: Duration) -> (Arc<MockConnector>, Arc<Dispatcher>, MigrationCoordinator) {
        let connector = Arc::new(MockConnector::new());
        let connections = Arc::new(ConnectionManager::new(connector.clone()));
        let dispatcher = Arc::new(Dispatcher::new(connections, ProvisioningDefaults::default()));

        dispatcher
            .create(
                SRC,
                VmSpec {
                    name: "web1".to_string(),
                    ram_mib: 2048,
                    vcpus: 2,
                    disk_gib: 20,
                    iso: None,
                    os_variant: Some("debian12".to_string()),
                },
            )
            .await
            .unwrap();
        dispatcher.start(SRC, "web1").await.unwrap();

        let coordinator = MigrationCoordinator::new(dispatcher.clone(), ack_timeout, true);
        (connector, dispatcher, coordinator)
    }

    #[tokio::test]
    async fn test_running_vm_migrates() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;

        let job = coordinator.migrate(SRC, "web1", DST).await.unwrap();
        assert_eq!(job.status, MigrationStatus::Committed);
        assert_eq!(job.source_state, Some(VmState::Running));
        assert!(job.finished_at.is_some());

        assert_eq!(dispatcher.state(DST, "web1").await.unwrap(), VmState::Running);
        assert!(!connector.host(SRC).vm_exists("web1").await.unwrap());

        // Same guest, never powered off or booted again
        assert_eq!(connector.host(SRC).call_count(MockOp::Stop), 0);
        assert_eq!(connector.host(DST).call_count(MockOp::Start), 0);
        assert_eq!(connector.host(DST).boot_count("web1"), Some(1));

        let moved = dispatcher.vm_info(DST, "web1").await.unwrap();
        assert_eq!(moved.memory_mib, 2048);
        assert_eq!(moved.os_variant, "debian12");
    }

    #[tokio::test]
    async fn test_paused_vm_stays_paused() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        dispatcher.pause(SRC, "web1").await.unwrap();

        coordinator.migrate(SRC, "web1", DST).await.unwrap();
        assert_eq!(dispatcher.state(DST, "web1").await.unwrap(), VmState::Paused);
        assert_eq!(connector.host(DST).call_count(MockOp::Start), 0);
        assert_eq!(connector.host(DST).call_count(MockOp::Pause), 0);
        assert_eq!(connector.host(DST).boot_count("web1"), Some(1));
    }

    #[tokio::test]
    async fn test_failed_live_transfer_rolls_back() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        connector.host(SRC).fail_next(
            MockOp::MigrateLive,
            HypervisorError::MigrationFailed("unable to connect to server".to_string()),
        );

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::RolledBack);
        assert_eq!(failure.error.kind(), "driver_error");
        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Running);
        assert_eq!(dispatcher.recorded_state(SRC, "web1").await, Some(VmState::Running));
        assert!(dispatcher.list_vms(DST).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_migration_powers_off() {
        let (connector, dispatcher, _) = setup(DEFAULT_ACK_TIMEOUT).await;
        let coordinator = MigrationCoordinator::new(dispatcher.clone(), DEFAULT_ACK_TIMEOUT, false);

        let job = coordinator.migrate(SRC, "web1", DST).await.unwrap();
        assert!(!job.live);
        assert_eq!(connector.host(SRC).call_count(MockOp::MigrateLive), 0);
        assert_eq!(dispatcher.state(DST, "web1").await.unwrap(), VmState::Inactive);
    }

    #[tokio::test]
    async fn test_collision_fails_preflight() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        dispatcher
            .create(
                DST,
                VmSpec {
                    name: "web1".to_string(),
                    ram_mib: 512,
                    vcpus: 1,
                    disk_gib: 5,
                    iso: None,
                    os_variant: None,
                },
            )
            .await
            .unwrap();

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::Failed);
        assert_eq!(failure.error.kind(), "name_collision");
        assert_eq!(connector.host(SRC).call_count(MockOp::Export), 0);
        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Running);
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_source_unchanged() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        connector.host(DST).fail_next(
            MockOp::PrepareIncoming,
            HypervisorError::MigrationFailed("disk not visible on destination".to_string()),
        );

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::Failed);
        assert_eq!(failure.error.kind(), "driver_error");
        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Running);
        assert!(dispatcher.list_vms(DST).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_acknowledgment_rolls_back() {
        let (connector, dispatcher, coordinator) = setup(Duration::from_millis(50)).await;
        connector
            .host(DST)
            .set_confirm_delay(Some(Duration::from_millis(500)));

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::RolledBack);
        assert_eq!(failure.error.kind(), "partial_failure");

        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Running);
        assert!(!connector.host(DST).has_incoming("web1"));
        assert!(dispatcher.list_vms(DST).await.unwrap().is_empty());
        assert_eq!(connector.host(SRC).call_count(MockOp::Stop), 0);
    }

    #[tokio::test]
    async fn test_failed_offline_release_restores_source() {
        let (connector, dispatcher, _) = setup(DEFAULT_ACK_TIMEOUT).await;
        let coordinator = MigrationCoordinator::new(dispatcher.clone(), DEFAULT_ACK_TIMEOUT, false);
        connector.host(SRC).fail_next(
            MockOp::Release,
            HypervisorError::Internal("undefine failed".to_string()),
        );

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::RolledBack);
        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Running);
        assert!(dispatcher.list_vms(DST).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_release_after_live_transfer() {
        let (connector, dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        connector.host(SRC).fail_next(
            MockOp::Release,
            HypervisorError::Internal("undefine failed".to_string()),
        );

        let failure = coordinator.migrate(SRC, "web1", DST).await.unwrap_err();
        assert_eq!(failure.job.status, MigrationStatus::Failed);
        assert_eq!(failure.error.kind(), "partial_failure");

        // Running in exactly one place
        assert_eq!(dispatcher.state(DST, "web1").await.unwrap(), VmState::Running);
        assert_eq!(dispatcher.state(SRC, "web1").await.unwrap(), VmState::Inactive);
    }

    #[tokio::test]
    async fn test_same_uri_rejected() {
        let (_connector, _dispatcher, coordinator) = setup(DEFAULT_ACK_TIMEOUT).await;
        let failure = coordinator.migrate(SRC, "web1", SRC).await.unwrap_err();
        assert_eq!(failure.error.kind(), "invalid_request");
    }
}
