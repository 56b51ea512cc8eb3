//! # virtpilot Hypervisor
//!
//! Driver abstraction for the virtpilot control service.
//!
//! A [`Connector`] opens sessions by URI; each session is a [`Hypervisor`]
//! that addresses VMs by name. Two backends are provided:
//! - **Libvirt/QEMU** (feature `libvirt`) - the production driver
//! - **Mock** - an in-memory host with fault injection, used by tests and
//!   `--dev` mode
//!
//! ```text
//! ┌──────────────┐  open(uri)  ┌─────────────────────────────────┐
//! │  Connector   │────────────▶│        Hypervisor Trait         │
//! └──────────────┘             │ (lifecycle, snapshots, migrate) │
//!                              └───────────────┬─────────────────┘
//!                                  ┌───────────┴───────────┐
//!                                  ▼                       ▼
//!                         ┌────────────────┐      ┌────────────────┐
//!                         │ LibvirtBackend │      │  MockBackend   │
//!                         └────────────────┘      └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtpilot_hypervisor::{Connector, MockConnector, VmConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let connector = MockConnector::new();
//!     let hv = connector.open("qemu:///system").await.unwrap();
//!
//!     let config = VmConfig::new("my-vm").with_cpu(2).with_memory(2048);
//!     hv.create_vm(config).await.unwrap();
//!     hv.start_vm("my-vm").await.unwrap();
//! }
//! ```

pub mod error;
pub mod guest_os;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;
pub mod xml;

pub use error::HypervisorError;
pub use mock::{MockBackend, MockConnector, MockOp};
pub use traits::{Connector, Hypervisor, HypervisorCapabilities};
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtBackend, LibvirtConnector};
