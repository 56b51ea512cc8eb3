//! # virtpilot Node
//!
//! Backend control service for hypervisor-hosted VMs. Stateless HTTP
//! requests are mapped onto long-lived, fallible hypervisor sessions:
//!
//! ```text
//! HTTP API ──▶ Dispatcher (per-VM lock, state machine) ──▶ ConnectionManager ──▶ Hypervisor
//!                  ▲                ▲
//!      SnapshotService      MigrationCoordinator
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod http_server;
pub mod iso_manager;
pub mod migration;
pub mod server;
pub mod snapshot;
pub mod state_machine;

pub use connection::{Connection, ConnectionManager};
pub use dispatcher::{Dispatcher, ProvisioningDefaults, VmSpec};
pub use error::{ControlError, Result};
pub use migration::{MigrationCoordinator, MigrationFailure, MigrationJob, MigrationStatus};
pub use snapshot::SnapshotService;
pub use state_machine::{Action, Outcome};
