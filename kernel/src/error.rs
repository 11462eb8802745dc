//! Kernel error types.
//!
//! A single flat enum covers every fallible kernel operation. Call sites
//! match on the variant they care about and propagate the rest with `?`.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A physical or virtual allocation could not be satisfied.
    OutOfMemory { requested: usize, available: usize },
    /// A named resource (CPU, IRQ, ACPI table, ...) does not exist.
    NotFound { resource: &'static str, id: u64 },
    /// A virtual address already has a mapping.
    AlreadyMapped { va: usize },
    /// A virtual address has no mapping.
    NotMapped { va: usize },
    /// An argument failed validation.
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// A bounded wait (IPI ack, AP bring-up, PIT calibration) did not
    /// complete in time.
    Timeout { operation: &'static str, duration_ms: u64 },
    /// The platform does not provide a feature the kernel needs.
    Unsupported { feature: &'static str },
    /// An unrecoverable condition; the caller should not attempt to
    /// continue running the affected subsystem.
    Fatal { reason: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::NotFound { resource, id } => write!(f, "{} {} not found", resource, id),
            Self::AlreadyMapped { va } => write!(f, "address 0x{:x} already mapped", va),
            Self::NotMapped { va } => write!(f, "address 0x{:x} not mapped", va),
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::Timeout {
                operation,
                duration_ms,
            } => write!(f, "timeout during {}: {} ms", operation, duration_ms),
            Self::Unsupported { feature } => write!(f, "unsupported feature: {}", feature),
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
        }
    }
}

/// Shorthand for building a [`KernelError`] variant without repeating the
/// enum path at every call site.
#[macro_export]
macro_rules! kernel_error {
    (OutOfMemory { requested: $req:expr, available: $avail:expr }) => {
        $crate::error::KernelError::OutOfMemory {
            requested: $req,
            available: $avail,
        }
    };
    (NotFound { resource: $res:expr, id: $id:expr }) => {
        $crate::error::KernelError::NotFound {
            resource: $res,
            id: $id,
        }
    };
    (InvalidArgument { $name:expr => $value:expr }) => {
        $crate::error::KernelError::InvalidArgument {
            name: $name,
            value: $value,
        }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
