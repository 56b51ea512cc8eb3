//! End-to-end behaviour of the dispatcher and its clients against the mock
//! hypervisor.

use std::sync::Arc;
use std::time::Duration;

use virtpilot_hypervisor::{HypervisorError, MockConnector, MockOp, VmState};
use virtpilot_node::{
    ConnectionManager, ControlError, Dispatcher, MigrationCoordinator, MigrationStatus,
    ProvisioningDefaults, SnapshotService, VmSpec,
};

const URI: &str = "qemu:///system";

struct Harness {
    connector: Arc<MockConnector>,
    dispatcher: Arc<Dispatcher>,
    snapshots: SnapshotService,
}

fn harness() -> Harness {
    let connector = Arc::new(MockConnector::new());
    let connections = Arc::new(ConnectionManager::new(connector.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        connections,
        ProvisioningDefaults {
            iso_dir: "/srv/iso".into(),
            bridge: "br0".to_string(),
        },
    ));
    Harness {
        connector,
        snapshots: SnapshotService::new(dispatcher.clone()),
        dispatcher,
    }
}

fn web1() -> VmSpec {
    VmSpec {
        name: "web1".to_string(),
        ram_mib: 1024,
        vcpus: 1,
        disk_gib: 10,
        iso: Some("debian.iso".to_string()),
        os_variant: None,
    }
}

async fn listed(h: &Harness) -> Vec<String> {
    h.dispatcher
        .list_vms(URI)
        .await
        .unwrap()
        .into_iter()
        .map(|vm| vm.name)
        .collect()
}

#[tokio::test]
async fn full_lifecycle_scenario() {
    let h = harness();

    let vm = h.dispatcher.create(URI, web1()).await.unwrap();
    assert_eq!(vm.state, VmState::Inactive);
    assert_eq!(vm.memory_mib, 1024);
    assert_eq!(vm.disk_gib, 10);

    h.dispatcher.start(URI, "web1").await.unwrap();
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Running);

    h.dispatcher.pause(URI, "web1").await.unwrap();
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Paused);

    h.dispatcher.resume(URI, "web1").await.unwrap();
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Running);

    h.snapshots.create(URI, "web1", "s1").await.unwrap();
    let names: Vec<String> = h
        .snapshots
        .list(URI, "web1")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["s1"]);

    h.dispatcher.stop(URI, "web1").await.unwrap();
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Inactive);

    h.dispatcher.delete(URI, "web1").await.unwrap();
    assert!(listed(&h).await.is_empty());
    assert_eq!(h.dispatcher.recorded_state(URI, "web1").await, None);
}

#[tokio::test]
async fn recorded_state_matches_observed_after_each_operation() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();

    for op in ["start", "pause", "stop", "start", "restart"] {
        match op {
            "start" => h.dispatcher.start(URI, "web1").await.unwrap(),
            "pause" => h.dispatcher.pause(URI, "web1").await.unwrap(),
            "stop" => h.dispatcher.stop(URI, "web1").await.unwrap(),
            _ => h.dispatcher.restart(URI, "web1").await.unwrap(),
        };
        let recorded = h.dispatcher.recorded_state(URI, "web1").await;
        let observed = h.dispatcher.vm_info(URI, "web1").await.unwrap().state;
        assert_eq!(recorded, Some(observed), "after {}", op);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_vm_operations_are_serialized() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher
        .create(
            URI,
            VmSpec {
                name: "web2".to_string(),
                ..web1()
            },
        )
        .await
        .unwrap();

    let host = h.connector.host(URI);
    host.set_latency(Duration::from_millis(30));

    let mut tasks = Vec::new();
    for _ in 0..6 {
        for name in ["web1", "web2"] {
            let dispatcher = h.dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                let _ = dispatcher.start(URI, name).await;
                let _ = dispatcher.stop(URI, name).await;
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(host.peak_concurrency("web1"), 1);
    assert_eq!(host.peak_concurrency("web2"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_vms_run_in_parallel() {
    let h = harness();
    for name in ["a", "b", "c", "d"] {
        h.dispatcher
            .create(
                URI,
                VmSpec {
                    name: name.to_string(),
                    ..web1()
                },
            )
            .await
            .unwrap();
    }
    h.connector.host(URI).set_latency(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let tasks: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move { dispatcher.start(URI, name).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Four serialized starts would take at least 800ms
    assert!(started.elapsed() < Duration::from_millis(700));
}

#[tokio::test]
async fn stop_on_inactive_is_a_noop() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();

    assert!(h.dispatcher.stop(URI, "web1").await.is_ok());
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Inactive);
}

#[tokio::test]
async fn pause_on_inactive_is_an_invalid_transition() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();

    let err = h.dispatcher.pause(URI, "web1").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_transition");
    assert_eq!(err.to_string(), "Cannot pause a VM that is inactive");
}

#[tokio::test]
async fn start_on_running_reports_already_in_target_state() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();

    let err = h.dispatcher.start(URI, "web1").await.unwrap_err();
    assert_eq!(err.kind(), "already_in_target_state");
    assert_eq!(h.connector.host(URI).call_count(MockOp::Start), 1);
}

#[tokio::test]
async fn clone_of_running_vm_is_rejected_without_side_effects() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();

    let err = h.snapshots.clone_vm(URI, "web1", "web1-copy").await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidState { .. }));
    assert_eq!(listed(&h).await, vec!["web1"]);
    assert_eq!(h.connector.host(URI).call_count(MockOp::Clone), 0);
}

#[tokio::test]
async fn restart_that_cannot_start_again_is_a_partial_failure() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();

    h.connector.host(URI).fail_next(
        MockOp::Start,
        HypervisorError::StartFailed("no bootable device".to_string()),
    );

    let err = h.dispatcher.restart(URI, "web1").await.unwrap_err();
    assert_eq!(err.kind(), "partial_failure");
    assert!(err.to_string().contains("no bootable device"));
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Inactive);
    assert_eq!(
        h.dispatcher.recorded_state(URI, "web1").await,
        Some(VmState::Inactive)
    );
}

#[tokio::test]
async fn restart_where_stop_fails_leaves_vm_running() {
    let h = harness();
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();

    h.connector.host(URI).fail_next(
        MockOp::Stop,
        HypervisorError::StopFailed("qemu not responding".to_string()),
    );

    let err = h.dispatcher.restart(URI, "web1").await.unwrap_err();
    assert_eq!(err.kind(), "driver_error");
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Running);
}

#[tokio::test]
async fn unacknowledged_migration_leaves_source_as_it_was() {
    let h = harness();
    let dest = "qemu+ssh://node-b/system";
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();
    h.dispatcher.pause(URI, "web1").await.unwrap();

    h.connector
        .host(dest)
        .set_confirm_delay(Some(Duration::from_secs(5)));
    let coordinator =
        MigrationCoordinator::new(h.dispatcher.clone(), Duration::from_millis(100), true);

    let before = h.dispatcher.state(URI, "web1").await.unwrap();
    let failure = coordinator.migrate(URI, "web1", dest).await.unwrap_err();
    let after = h.dispatcher.state(URI, "web1").await.unwrap();

    assert_eq!(failure.job.status, MigrationStatus::RolledBack);
    assert_eq!(before, after);
    assert!(h.dispatcher.list_vms(dest).await.unwrap().is_empty());
}

#[tokio::test]
async fn migration_moves_vm_between_hosts() {
    let h = harness();
    let dest = "qemu+ssh://node-b/system";
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();
    h.snapshots.create(URI, "web1", "before-move").await.unwrap();

    let coordinator =
        MigrationCoordinator::new(h.dispatcher.clone(), Duration::from_secs(5), true);
    let job = coordinator.migrate(URI, "web1", dest).await.unwrap();

    assert_eq!(job.status, MigrationStatus::Committed);
    assert!(listed(&h).await.is_empty());
    assert_eq!(h.dispatcher.state(dest, "web1").await.unwrap(), VmState::Running);

    // The guest kept running: no power-off on the source, no boot on the destination
    assert_eq!(h.connector.host(URI).call_count(MockOp::Stop), 0);
    assert_eq!(h.connector.host(dest).call_count(MockOp::Start), 0);
    assert_eq!(h.connector.host(dest).boot_count("web1"), Some(1));

    let hosts = h.dispatcher.connections().hosts().await;
    let mut expected = vec![URI.to_string(), dest.to_string()];
    expected.sort();
    assert_eq!(hosts, expected);
}

#[tokio::test]
async fn offline_migration_leaves_destination_inactive() {
    let h = harness();
    let dest = "qemu+ssh://node-b/system";
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();

    let coordinator =
        MigrationCoordinator::new(h.dispatcher.clone(), Duration::from_secs(5), false);
    coordinator.migrate(URI, "web1", dest).await.unwrap();

    assert_eq!(h.dispatcher.state(dest, "web1").await.unwrap(), VmState::Inactive);
}

#[tokio::test]
async fn unreachable_destination_fails_before_touching_source() {
    let h = harness();
    let dest = "qemu+ssh://gone/system";
    h.dispatcher.create(URI, web1()).await.unwrap();
    h.dispatcher.start(URI, "web1").await.unwrap();
    h.connector.set_unreachable(dest, true);

    let coordinator =
        MigrationCoordinator::new(h.dispatcher.clone(), Duration::from_secs(5), true);
    let failure = coordinator.migrate(URI, "web1", dest).await.unwrap_err();

    assert_eq!(failure.job.status, MigrationStatus::Failed);
    assert_eq!(failure.error.kind(), "connection_error");
    assert_eq!(h.dispatcher.state(URI, "web1").await.unwrap(), VmState::Running);
}
