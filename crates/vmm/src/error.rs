//! Error types shared by every virtual-memory operation.

use thiserror::Error;

/// Errors reported by address-space operations and consumed capabilities.
///
/// Internal consistency failures are reported through [`invariant_violation`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// An allocation or address-range reservation could not be satisfied.
    #[error("out of memory or address space")]
    NoMemory,
    /// A parameter was malformed, or the object already exists.
    #[error("invalid argument")]
    InvalidArgument,
    /// An address is unaligned or does not name a region.
    #[error("bad address")]
    BadAddress,
    /// The requested range collides with an existing region.
    #[error("range would overlap an existing region")]
    WouldOverlap,
    /// The requested range falls outside the address space.
    #[error("range is outside the address space")]
    OutOfRange,
    /// The object is being torn down; the caller may retry against a fresh object.
    #[error("address space is busy")]
    Busy,
    /// A lookup found nothing.
    #[error("not found")]
    NotFound,
}

/// Result type used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

/// Reports a detected internal inconsistency and halts through the panic path.
///
/// Continuing after one of these risks corrupting memory, so there is no recovery.
#[cold]
#[track_caller]
pub fn invariant_violation(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("vm invariant violated: {}", args);
    panic!("vm invariant violated: {}", args)
}
