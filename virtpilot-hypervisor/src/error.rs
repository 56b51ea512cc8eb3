//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// An established connection stopped answering.
    #[error("Connection to hypervisor lost: {0}")]
    ConnectionLost(String),

    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// A VM with this name is already defined.
    #[error("VM already exists: {0}")]
    VmAlreadyExists(String),

    /// Failed to create a VM.
    #[error("Failed to create VM: {0}")]
    CreateFailed(String),

    /// Failed to start a VM.
    #[error("Failed to start VM: {0}")]
    StartFailed(String),

    /// Failed to stop a VM.
    #[error("Failed to stop VM: {0}")]
    StopFailed(String),

    /// Failed to delete a VM.
    #[error("Failed to delete VM: {0}")]
    DeleteFailed(String),

    /// General operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Snapshot operation failed.
    #[error("Snapshot operation failed: {0}")]
    SnapshotFailed(String),

    /// Snapshot not found.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A snapshot with this name already exists.
    #[error("Snapshot already exists: {0}")]
    SnapshotAlreadyExists(String),

    /// Clone failed.
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// VM is in an invalid state for the requested operation.
    #[error("Invalid VM state for operation: {0}")]
    InvalidState(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Whether the error means the connection itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            HypervisorError::ConnectionFailed(_) | HypervisorError::ConnectionLost(_)
        )
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
