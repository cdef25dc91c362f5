//! Device error types

use thiserror::Error;

/// Device error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Memory copy failed: {0}")]
    MemoryCopyFailed(String),
    #[error("Queue submission failed: {0}")]
    SubmissionFailed(String),
    #[error("Execution fault: {0}")]
    ExecutionFault(String),
    #[error("Dependency '{label}' faulted: {message}")]
    DependencyFaulted { label: String, message: String },
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Allocation and copy failures may succeed once other in-flight work
    /// releases its buffers. Faults, closed queues and poisoned locks are
    /// permanent.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DeviceError::MemoryAllocationFailed(_) | DeviceError::MemoryCopyFailed(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
