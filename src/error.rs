//! Unified error handling for woqforge
//!
//! Every synchronous failure of the WoQ pipeline is reported through
//! [`WoqError`]. Errors are categorized so callers can tell apart:
//! - User errors (precondition violations, bad shapes, unsupported dtypes)
//! - Backend errors (device allocation/submission failures)
//! - Internal errors (bugs, poisoned locks)
//!
//! Faults raised by the device while a submitted unit of work runs are
//! NOT reported here; they surface through the returned [`Event`].
//!
//! [`Event`]: crate::backend::Event

use std::fmt;

use crate::backend::DeviceError;
use crate::tensor::DataType;

/// Unified error type for woqforge
#[derive(Debug, thiserror::Error)]
pub enum WoqError {
    // ========== Precondition Errors ==========
    /// Operand rank outside the accepted set
    #[error("woq matmul only accepts {expected} {operand}, got {actual}D")]
    InvalidDimensionality {
        operand: &'static str,
        expected: &'static str,
        actual: usize,
    },

    /// Group size zero or not dividing the reduction dimension
    #[error("group size {group_size} must be positive and evenly divide K={k}")]
    GroupSizeMismatch { k: usize, group_size: usize },

    /// Operand shape inconsistent with the problem
    #[error("shape mismatch for {operand}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        operand: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Any other violated precondition
    #[error("precondition violated: {0}")]
    InvalidPrecondition(String),

    /// Data type not supported for the operand's role
    #[error("unsupported data type {dtype} for {operand}")]
    UnsupportedDtype {
        operand: &'static str,
        dtype: DataType,
    },

    // ========== Plan Construction Errors ==========
    /// Execution plan could not be built from the given descriptors/attributes
    #[error("primitive creation failed: {0}")]
    PrimitiveCreation(String),

    /// A descriptor addresses more bytes than its buffer holds
    #[error("memory view out of bounds: descriptor needs {required} bytes, buffer holds {available}")]
    MemoryViewOutOfBounds { required: usize, available: usize },

    /// Execution argument missing or bound with the wrong descriptor
    #[error("invalid execution argument: {0}")]
    InvalidArgument(String),

    // ========== Backend Errors ==========
    /// Device layer failure (allocation, submission)
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    Internal(String),

    /// Lock poisoned (indicates a bug)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl WoqError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            WoqError::InvalidDimensionality { .. }
            | WoqError::GroupSizeMismatch { .. }
            | WoqError::ShapeMismatch { .. }
            | WoqError::InvalidPrecondition(_)
            | WoqError::UnsupportedDtype { .. }
            | WoqError::PrimitiveCreation(_)
            | WoqError::MemoryViewOutOfBounds { .. }
            | WoqError::InvalidArgument(_) => ErrorCategory::User,

            WoqError::Device(_) => ErrorCategory::Backend,

            WoqError::Internal(_) | WoqError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Precondition violations are detected before any device work exists
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            WoqError::InvalidDimensionality { .. }
                | WoqError::GroupSizeMismatch { .. }
                | WoqError::ShapeMismatch { .. }
                | WoqError::InvalidPrecondition(_)
        )
    }

    /// Check if this error is recoverable (temporary condition)
    pub fn is_recoverable(&self) -> bool {
        match self {
            WoqError::Device(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Device failure
    Backend,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for WoqError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        WoqError::LockPoisoned(err.to_string())
    }
}

/// Result type for woqforge operations
pub type WoqResult<T> = std::result::Result<T, WoqError>;

/// Create a precondition error with context
#[macro_export]
macro_rules! precondition_error {
    ($msg:expr) => {
        $crate::error::WoqError::InvalidPrecondition($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::WoqError::InvalidPrecondition(format!($fmt, $($arg)*))
    };
}

/// Create a primitive-creation error with context
#[macro_export]
macro_rules! primitive_error {
    ($msg:expr) => {
        $crate::error::WoqError::PrimitiveCreation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::WoqError::PrimitiveCreation(format!($fmt, $($arg)*))
    };
}
