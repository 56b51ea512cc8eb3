//! Service wiring and lifecycle.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use virtpilot_hypervisor::{Connector, MockConnector};

use crate::config::{Config, HypervisorBackend};
use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::http_server::{self, AppState};
use crate::iso_manager::IsoCatalog;
use crate::migration::MigrationCoordinator;
use crate::snapshot::SnapshotService;

/// Pick the driver that opens hypervisor sessions.
pub fn build_connector(config: &Config) -> Arc<dyn Connector> {
    match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend");
            Arc::new(MockConnector::new())
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                info!(pool = %config.hypervisor.storage_pool, "Using libvirt backend");
                Arc::new(virtpilot_hypervisor::LibvirtConnector::new(
                    config.hypervisor.storage_pool.clone(),
                ))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                warn!("Libvirt backend requested but not compiled in, falling back to mock");
                Arc::new(MockConnector::new())
            }
        }
    }
}

/// Assemble the services behind the HTTP API.
pub fn build_state(config: &Config, connector: Arc<dyn Connector>) -> Arc<AppState> {
    let connections = Arc::new(ConnectionManager::new(connector));
    let dispatcher = Arc::new(Dispatcher::new(connections, config.provisioning()));

    Arc::new(AppState {
        snapshots: SnapshotService::new(dispatcher.clone()),
        migration: MigrationCoordinator::new(
            dispatcher.clone(),
            config.migration.ack_timeout(),
            config.migration.live,
        ),
        iso: IsoCatalog::new(config.iso.path.clone()),
        default_uri: config.hypervisor.default_uri.clone(),
        dispatcher,
    })
}

/// Run the control service.
pub async fn run(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let state = build_state(&config, build_connector(&config));

    // Connect eagerly so a bad default URI shows up at startup
    match state.dispatcher.health(&state.default_uri).await {
        Ok(caps) => info!(
            uri = %state.default_uri,
            name = %caps.name,
            version = %caps.version,
            live_migration = caps.supports_live_migration,
            snapshots = caps.supports_snapshots,
            "Hypervisor capabilities"
        ),
        Err(e) => warn!(
            uri = %state.default_uri,
            error = %e,
            "Default hypervisor not reachable yet, will retry on first request"
        ),
    }

    info!(
        iso_path = %config.iso.path.display(),
        ack_timeout_secs = config.migration.ack_timeout_secs,
        live_migration = config.migration.live,
        "Control service configured"
    );

    http_server::run_http_server(addr, state).await
}
