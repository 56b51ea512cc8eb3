//! Normalized control errors.
//!
//! Every driver failure is converted into a [`ControlError`] before it leaves
//! the dispatcher, so callers (and the HTTP gateway) only ever see this
//! taxonomy.

use thiserror::Error;
use virtpilot_hypervisor::{HypervisorError, VmState};

use crate::state_machine::Action;

/// Errors reported by the control service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The hypervisor at `uri` is unreachable or the session broke.
    #[error("Cannot reach hypervisor at {uri}: {reason}")]
    Connection { uri: String, reason: String },

    /// The action is not permitted from the VM's current state.
    #[error("Cannot {action} a VM that is {state}")]
    InvalidTransition { state: VmState, action: Action },

    /// The VM is already where the action would take it.
    #[error("VM '{name}' is already {state}")]
    AlreadyInTargetState { name: String, state: VmState },

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("Snapshot '{snapshot}' not found for VM '{vm}'")]
    SnapshotNotFound { vm: String, snapshot: String },

    /// The source of a clone does not exist.
    #[error("Source VM '{0}' not found")]
    SourceNotFound(String),

    #[error("Snapshot '{snapshot}' already exists for VM '{vm}'")]
    DuplicateSnapshot { vm: String, snapshot: String },

    /// A VM with this name already exists on the target hypervisor.
    #[error("A VM named '{name}' already exists on {uri}")]
    NameCollision { name: String, uri: String },

    /// The VM's state rules out an operation outside the lifecycle table.
    #[error("VM '{name}' is {state}: {reason}")]
    InvalidState {
        name: String,
        state: VmState,
        reason: String,
    },

    /// Part of a multi-step operation took effect. Re-query the VM.
    #[error("Partial failure: {0}")]
    PartialFailure(String),

    /// Opaque driver failure, message passed through.
    #[error("Driver error: {0}")]
    Driver(String),

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Connection { .. } => "connection_error",
            ControlError::InvalidTransition { .. } => "invalid_transition",
            ControlError::AlreadyInTargetState { .. } => "already_in_target_state",
            ControlError::VmNotFound(_) => "vm_not_found",
            ControlError::SnapshotNotFound { .. } => "snapshot_not_found",
            ControlError::SourceNotFound(_) => "source_not_found",
            ControlError::DuplicateSnapshot { .. } => "duplicate_snapshot",
            ControlError::NameCollision { .. } => "name_collision",
            ControlError::InvalidState { .. } => "invalid_state",
            ControlError::PartialFailure(_) => "partial_failure",
            ControlError::Driver(_) => "driver_error",
            ControlError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Normalize a driver error raised while operating on `vm` at `uri`.
    pub fn from_driver(err: HypervisorError, uri: &str, vm: &str) -> Self {
        match err {
            HypervisorError::ConnectionFailed(reason) | HypervisorError::ConnectionLost(reason) => {
                ControlError::Connection {
                    uri: uri.to_string(),
                    reason,
                }
            }
            HypervisorError::VmNotFound(name) => ControlError::VmNotFound(name),
            HypervisorError::VmAlreadyExists(name) => ControlError::NameCollision {
                name,
                uri: uri.to_string(),
            },
            HypervisorError::SnapshotNotFound(snapshot) => ControlError::SnapshotNotFound {
                vm: vm.to_string(),
                snapshot,
            },
            HypervisorError::SnapshotAlreadyExists(snapshot) => ControlError::DuplicateSnapshot {
                vm: vm.to_string(),
                snapshot,
            },
            HypervisorError::InvalidConfig(reason) => ControlError::InvalidRequest(reason),
            other => ControlError::Driver(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_errors_normalized() {
        let err = ControlError::from_driver(
            HypervisorError::ConnectionLost("eof".to_string()),
            "qemu:///system",
            "web1",
        );
        assert_eq!(err.kind(), "connection_error");

        let err = ControlError::from_driver(
            HypervisorError::SnapshotAlreadyExists("s1".to_string()),
            "qemu:///system",
            "web1",
        );
        assert_eq!(
            err,
            ControlError::DuplicateSnapshot {
                vm: "web1".to_string(),
                snapshot: "s1".to_string()
            }
        );

        let err = ControlError::from_driver(
            HypervisorError::StartFailed("no bootable device".to_string()),
            "qemu:///system",
            "web1",
        );
        assert_eq!(err.kind(), "driver_error");
        assert!(err.to_string().contains("no bootable device"));
    }

    #[test]
    fn test_transition_message_names_state_and_action() {
        let err = ControlError::InvalidTransition {
            state: VmState::Inactive,
            action: Action::Pause,
        };
        assert_eq!(err.to_string(), "Cannot pause a VM that is inactive");
    }
}
