//! Collaborator traits the VM core is generic over, in place of reading
//! kernel globals directly. Mirrors the registrable-hook style used
//! elsewhere in the kernel for architecture-specific operations: the core
//! logic takes a trait object instead of calling a bare extern function, so
//! tests can supply a synthetic implementation.

use crate::addr::PhysAddr;

/// A physical frame allocator.
///
/// # Safety
///
/// Implementations must return unique, page-aligned physical frames that are
/// not in use elsewhere.
pub unsafe trait FrameAllocator {
    /// Allocates a single physical frame, returning `None` if out of memory.
    fn allocate_frame(&mut self) -> Option<PhysAddr>;
}

/// A physical frame deallocator.
///
/// # Safety
///
/// Implementations must only deallocate frames previously returned by the
/// corresponding allocator and no longer in use.
pub unsafe trait FrameDeallocator {
    /// Returns a physical frame to the allocator.
    unsafe fn deallocate_frame(&mut self, frame: PhysAddr);
}

/// Zeroes and copies frame contents. Abstracts over how a physical frame is
/// accessed from kernel code (normally via a fixed kernel-segment alias);
/// tests implement this directly against host memory.
pub trait FrameAccess {
    /// Zero-fills the frame at `frame`.
    fn zero(&mut self, frame: PhysAddr);

    /// Copies the full contents of `src` into `dst`. The two frames must not
    /// overlap.
    fn copy(&mut self, src: PhysAddr, dst: PhysAddr);
}

/// The hardware TLB, modeled as a fixed-size array of `(hi, lo)` slots.
pub trait Tlb {
    /// Number of hardware TLB entries.
    const NUM_ENTRIES: usize;

    /// Writes an entry at a specific index.
    fn write(&mut self, index: usize, hi: u32, lo: u32);

    /// Writes an entry at an implementation-chosen (e.g. round-robin) index.
    fn write_random(&mut self, hi: u32, lo: u32);
}

/// An opaque interrupt-priority token returned by [`InterruptControl::raise`]
/// and consumed by [`InterruptControl::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptLevel(pub u32);

/// Interrupt-priority control, used to bracket TLB writes.
pub trait InterruptControl {
    /// Raises interrupt priority to the maximum, returning the prior level.
    fn raise(&mut self) -> InterruptLevel;

    /// Restores a previously-saved interrupt level.
    fn restore(&mut self, prior: InterruptLevel);
}
