//! Error types for the capsule daemon.
//!
//! The IPC layer translates these 1:1 into wire errors via [`CapsuleError::code`],
//! so every operation the daemon exposes fails with exactly one of these kinds.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapsuleError {
    /// Bad signature or manifest. Never retried; surfaced to the caller.
    #[error("verification of {} failed: {reason}", path.display())]
    VerificationFailed { path: PathBuf, reason: String },

    /// The block-device metadata walk failed. Logged and skipped during
    /// reconciliation, fatal during fresh activation.
    #[error("cannot resolve block device {device}: {reason}")]
    UnresolvableDevice { device: String, reason: String },

    /// Mount point still referenced during deactivation. Caller may retry.
    #[error("{} is still in use", path.display())]
    BusyResource { path: PathBuf },

    /// Session operation requested in a state that forbids it.
    #[error("invalid session operation: {0}")]
    InvalidState(String),

    /// Loop/mapper creation or teardown failed. Fatal to the enclosing
    /// activation; triggers rollback of siblings in the same group.
    #[error("device operation failed: {0}")]
    DeviceOperationFailed(String),

    /// A session state transition could not be durably recorded.
    #[error("failed to persist session state: {0}")]
    PersistenceFailed(String),
}

impl CapsuleError {
    /// Stable wire code for the IPC layer.
    pub fn code(&self) -> i32 {
        match self {
            CapsuleError::VerificationFailed { .. } => -32010,
            CapsuleError::UnresolvableDevice { .. } => -32011,
            CapsuleError::BusyResource { .. } => -32012,
            CapsuleError::InvalidState(_) => -32013,
            CapsuleError::DeviceOperationFailed(_) => -32014,
            CapsuleError::PersistenceFailed(_) => -32015,
        }
    }
}

pub type Result<T> = std::result::Result<T, CapsuleError>;
