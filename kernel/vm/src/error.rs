//! VM core error kinds.

use core::fmt;

/// Errors produced by the VM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No current address space, the address lies outside every defined
    /// region and the stack window, or the fault was a write to a
    /// write-protected page.
    BadAddress,
    /// An allocator (frame or small-object) returned failure. Any partial
    /// work performed before the failure has been rolled back.
    OutOfMemory,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "bad address"),
            VmError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Convenience alias for results returned by the VM core.
pub type VmResult<T> = Result<T, VmError>;
