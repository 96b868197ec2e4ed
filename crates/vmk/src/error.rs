//! Runtime status codes.

use thiserror::Error;
use vmm::PoolError;

/// Result type returned by every runtime operation.
pub type VmResult<T> = Result<T, VmError>;

/// Runtime errors.
///
/// The variants mirror the status codes callers of the runtime branch on;
/// [`VmError::code`] returns the numeric form.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmError {
    /// Timed out, trylock miss, or a generic failure.
    #[error("operation failed")]
    Failure,
    /// Zero size, illegal priority or timeout, or an address the pool does
    /// not own.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Unknown thread, mutex, or pool id.
    #[error("invalid id")]
    InvalidId,
    /// Operation not allowed in the object's current state.
    #[error("invalid state")]
    InvalidState,
    /// Allocation could not be satisfied.
    #[error("insufficient resources")]
    InsufficientResources,
}

impl VmError {
    /// Numeric status code; success is 0.
    pub const fn code(self) -> i32 {
        match self {
            Self::Failure => 1,
            Self::InvalidParameter => 2,
            Self::InvalidId => 3,
            Self::InvalidState => 4,
            Self::InsufficientResources => 5,
        }
    }
}

impl From<PoolError> for VmError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ZeroSize
            | PoolError::InvalidRegion { .. }
            | PoolError::BadAlignment(_)
            | PoolError::OutOfBounds(_)
            | PoolError::NotAllocated(_) => Self::InvalidParameter,
            PoolError::UnknownPool(_) => Self::InvalidId,
            PoolError::Exhausted { .. } => Self::InsufficientResources,
            PoolError::InUse { .. } | PoolError::HasWaiters { .. } => Self::InvalidState,
        }
    }
}
