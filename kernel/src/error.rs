//! Error types for the memory management core.
//!
//! The taxonomy below mirrors the core's error kinds rather than a type per
//! call site: resource exhaustion, invalid argument, corruption detected,
//! policy rejection, and (unchecked, by design) programmer bugs. Most of the
//! core's own contracts return an in-band `0`/`null` sentinel instead of a
//! `Result` -- `MemoryError` is reserved for the handful of call sites that
//! are explicitly documented as returning an error to let the caller try the
//! next handler (region registration, fault dispatch).

use core::fmt;

/// Error type for memory-subsystem operations that return a `Result`
/// instead of an in-band sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "memory errors must be handled, not silently discarded"]
pub enum MemoryError {
    /// Zone empty, slab/pool could not grow, region descriptor allocation
    /// failed.
    OutOfMemory { requested: usize, available: usize },
    /// Bad order, misaligned or out-of-range free address, NULL required
    /// pointer, bad zone tag.
    InvalidArgument { name: &'static str },
    /// Magic-word mismatch on a heap/slab pointer, or a PTE walk landing on
    /// an absent leaf when presence was required.
    Corruption { detail: &'static str },
    /// Overlapping region registration, fault in an unregistered region,
    /// fault on a page whose COW bit is clear.
    PolicyRejected { reason: &'static str },
    /// Subsystem consulted before its `init()` ran.
    NotInitialized { subsystem: &'static str },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl fmt::Display for MemoryError {
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
            Self::InvalidArgument { name } => write!(f, "invalid argument: {}", name),
            Self::Corruption { detail } => write!(f, "corruption detected: {}", detail),
            Self::PolicyRejected { reason } => write!(f, "rejected: {}", reason),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}
