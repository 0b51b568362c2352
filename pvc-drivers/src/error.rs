//! Error types for the driver layer.

use thiserror::Error;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The operation exceeded its deadline. A timeout is an operation
    /// failure, not a daemon failure.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The driver target will not respond at all.
    #[error("Driver unreachable: {0}")]
    Unreachable(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Volume was not found.
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// The volume is locked by another node.
    #[error("Volume {volume} is locked by {holder}")]
    VolumeLocked { volume: String, holder: String },

    /// The target is in the wrong state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// External command exited non-zero; stderr is captured verbatim.
    #[error("Command {command} failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// General operation failure.
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
