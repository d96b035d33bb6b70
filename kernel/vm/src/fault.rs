//! TLB-miss fault handling (§4.8).

use crate::address_space::CurrentAddressSpace;
use crate::addr::VirtAddr;
use crate::error::{VmError, VmResult};
use crate::pte::{self, PageTableEntry};
use crate::region::RegionFlags;
use crate::traits::{FrameAccess, FrameAllocator, InterruptControl, Tlb};
use tarn_core::{ktrace, kwarn};

/// The kind of TLB exception that was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No translation was found for the address (the ordinary case this
    /// handler resolves).
    Miss,
    /// A write was attempted against a page the TLB marked read-only. Never
    /// fixed up: a write-protected page stays write-protected.
    ReadonlyViolation,
}

/// Resolves a TLB exception. On success, a translation for `fault_addr` has
/// been installed in the hardware TLB (lazily allocating the backing page
/// table structures and frame if this is the first access to the page).
pub fn fault<T: Tlb + ?Sized>(
    kind: FaultKind,
    fault_addr: VirtAddr,
    current: &mut dyn CurrentAddressSpace,
    alloc: &mut dyn FrameAllocator,
    access: &mut dyn FrameAccess,
    tlb: &mut T,
    irq: &mut impl InterruptControl,
) -> VmResult<()> {
    if kind == FaultKind::ReadonlyViolation {
        return Err(VmError::BadAddress);
    }

    let Some(as_) = current.current() else {
        return Err(VmError::BadAddress);
    };

    let mut dirty = false;
    let mut matched = false;
    for region in as_.regions() {
        if region.contains(fault_addr) {
            matched = true;
            dirty = region.flags().contains(RegionFlags::WRITE);
            break;
        }
    }

    if !matched {
        let floor = as_.stack_top() - crate::address_space::STACK_MAX_BYTES;
        if fault_addr >= floor && fault_addr < as_.stack_top() {
            dirty = true;
        } else {
            return Err(VmError::BadAddress);
        }
    }

    let existing = as_.lookup(fault_addr);
    let entry = if existing.is_present() {
        existing
    } else {
        let Some(frame) = alloc.allocate_frame() else {
            kwarn!("fault: out of memory allocating frame for {fault_addr}");
            return Err(VmError::OutOfMemory);
        };
        access.zero(frame);
        let flags = pte::VALID | if dirty { pte::DIRTY } else { 0 };
        let new_entry = PageTableEntry::new(frame, flags);
        as_.set_entry(fault_addr, new_entry);
        ktrace!("fault: paged in {fault_addr} -> {frame}");
        new_entry
    };

    let loading = as_.is_loading();
    let hi = fault_addr.align_down().as_u32();
    let lo = entry.raw() | if loading { pte::DIRTY } else { 0 };

    let prior = irq.raise();
    tlb.write_random(hi, lo);
    irq.restore(prior);

    Ok(())
}
