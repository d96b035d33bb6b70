//! Virtual-memory core for the tarn kernel: per-process address spaces over
//! a 32-bit, MIPS-like software-managed TLB.
//!
//! This crate owns the hard invariants — address-space/page-table
//! consistency, fault-driven lazy mapping, fork-style deep copy, and
//! teardown — and stays generic over the collaborators a real kernel
//! supplies (the physical frame allocator, the process abstraction, the
//! TLB and interrupt-priority primitives; see [`traits`]).
//!
//! Out of scope: page replacement, copy-on-write, SMP TLB shootdown, ASID
//! management, and memory-mapped device apertures beyond the fixed
//! kernel-segment alias. See the crate's design notes for the rationale.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod address_space;
pub mod error;
pub mod fault;
pub mod page_table;
pub mod pmm;
pub mod pte;
pub mod region;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use address_space::{AddressSpace, CurrentAddressSpace, STACK_MAX_BYTES, USERSTACK};
pub use error::{VmError, VmResult};
pub use fault::{FaultKind, fault};
pub use region::{Region, RegionFlags};
