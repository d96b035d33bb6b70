//! The per-process address space: page table, region list, and the stack
//! and heap bookkeeping the loader and fault handler need.

use alloc::vec::Vec;

use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::error::{VmError, VmResult};
use crate::page_table::PageTable;
use crate::pte::{self, PageTableEntry};
use crate::region::{Region, RegionFlags};
use crate::traits::{FrameAccess, FrameAllocator, FrameDeallocator, InterruptControl, Tlb};
use tarn_core::kwarn;

/// Top of the user stack. The stack grows down from here.
pub const USERSTACK: VirtAddr = VirtAddr::new(0x8000_0000);

/// Maximum size of the user stack: 16 pages.
pub const STACK_MAX_BYTES: u32 = 16 * PAGE_SIZE;

/// A process's virtual address space.
pub struct AddressSpace {
    page_table: PageTable,
    regions: Vec<Region>,
    stack_top: VirtAddr,
    heap_top: VirtAddr,
    /// Transient write-unlock used during ELF loading (§4.4). OR'd into
    /// every TLB entry the fault handler installs while set.
    loading: bool,
}

/// Gives the fault handler and the activate/deactivate hooks access to
/// "the currently bound address space" without reading a kernel global
/// directly. Production code implements this over the process abstraction;
/// tests implement it over a single owned `Option<AddressSpace>`.
pub trait CurrentAddressSpace {
    /// Returns the currently bound address space, if any.
    fn current(&mut self) -> Option<&mut AddressSpace>;
}

impl AddressSpace {
    /// Creates a fresh, empty address space: no regions, an empty page
    /// table, and the stack sentinel at [`USERSTACK`].
    pub fn create() -> VmResult<Self> {
        Ok(Self {
            page_table: PageTable::new(),
            regions: Vec::new(),
            stack_top: USERSTACK,
            heap_top: VirtAddr::new(0),
            loading: false,
        })
    }

    /// Returns the region list, most recently defined first.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the top of the user stack.
    pub const fn stack_top(&self) -> VirtAddr {
        self.stack_top
    }

    /// Returns the current top of the heap (end of the last defined region).
    pub const fn heap_top(&self) -> VirtAddr {
        self.heap_top
    }

    /// Returns whether this address space is mid-load (§4.4).
    pub const fn is_loading(&self) -> bool {
        self.loading
    }

    /// Looks up the page-table entry for `addr` without allocating.
    pub fn lookup(&self, addr: VirtAddr) -> PageTableEntry {
        self.page_table.lookup(addr)
    }

    /// Installs a page-table entry for `addr`, allocating the second-level
    /// slab if this is the first entry in its 4 MiB slice. Used by the
    /// fault handler to materialize a lazily-allocated mapping.
    pub fn set_entry(&mut self, addr: VirtAddr, entry: PageTableEntry) {
        self.page_table.set(addr, entry);
    }

    fn stack_floor(&self) -> VirtAddr {
        self.stack_top - STACK_MAX_BYTES
    }

    /// Declares a mappable region `[vaddr, vaddr + memsize)` with the given
    /// permissions. No frames are allocated; mapping happens lazily via the
    /// fault handler.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        memsize: u32,
        flags: RegionFlags,
    ) -> VmResult<()> {
        if vaddr.as_u32().wrapping_add(memsize) >= self.stack_floor().as_u32() {
            return Err(VmError::OutOfMemory);
        }
        let region = Region::aligned(vaddr, memsize, flags);
        self.heap_top = region.end();
        self.regions.insert(0, region);
        Ok(())
    }

    /// Declares the user stack region and returns its top (the initial stack
    /// pointer).
    pub fn define_stack(&mut self) -> VirtAddr {
        let base = self.stack_floor();
        self.regions
            .insert(0, Region::new(base, STACK_MAX_BYTES, RegionFlags::all()));
        self.stack_top
    }

    /// Enables the transient write-unlock used while the loader copies
    /// segment bytes in.
    pub fn prepare_load(&mut self) {
        self.loading = true;
    }

    /// Disables the transient write-unlock and flushes the hardware TLB, so
    /// that no stale DIRTY entry installed during loading survives.
    pub fn complete_load(&mut self, tlb: &mut impl Tlb, irq: &mut impl InterruptControl) {
        self.loading = false;
        flush_tlb(tlb, irq);
    }

    /// Deep-copies `old` into a fresh address space: every present
    /// page-table entry gets its own freshly allocated, content-identical
    /// frame (no copy-on-write, no shared frames). Allocation failure midway
    /// rolls back every frame allocated for the new address space so far.
    pub fn copy(
        &self,
        alloc: &mut dyn FrameAllocator,
        dealloc: &mut dyn FrameDeallocator,
        access: &mut dyn FrameAccess,
    ) -> VmResult<Self> {
        let mut new = Self::create()?;
        new.heap_top = self.heap_top;
        new.stack_top = self.stack_top;
        new.loading = self.loading;
        new.regions = self.regions.clone();

        for (i, j, entry) in self.page_table.iter_present() {
            let addr = level_indices_to_addr(i, j);
            let Some(frame) = alloc.allocate_frame() else {
                kwarn!("copy: out of memory, rolling back partially copied address space");
                free_present_frames(&new.page_table, dealloc);
                return Err(VmError::OutOfMemory);
            };
            access.zero(frame);
            access.copy(entry.phys(), frame);
            let new_entry = PageTableEntry::new(frame, pte::VALID).with_writable(entry.is_writable());
            new.page_table.set(addr, new_entry);
        }

        Ok(new)
    }

    /// Frees every frame this address space owns. The page table and region
    /// list themselves are reclaimed by ordinary drop glue once this call
    /// returns and `self` goes out of scope.
    pub fn destroy(self, dealloc: &mut dyn FrameDeallocator) {
        free_present_frames(&self.page_table, dealloc);
    }
}

fn level_indices_to_addr(level1: usize, level2: usize) -> VirtAddr {
    VirtAddr::new(((level1 as u32) << 22) | ((level2 as u32) << 12))
}

fn free_present_frames(table: &PageTable, dealloc: &mut dyn FrameDeallocator) {
    for (_, _, entry) in table.iter_present() {
        // SAFETY: every present entry names a frame this address space
        // exclusively owns (I1), and this is called exactly once per
        // address space, from `destroy` or from a `copy` rollback.
        unsafe { dealloc.deallocate_frame(entry.phys()) };
    }
}

/// Invalidates every hardware TLB entry, at elevated interrupt priority.
pub fn flush_tlb<T: Tlb + ?Sized>(tlb: &mut T, irq: &mut impl InterruptControl) {
    let prior = irq.raise();
    for index in 0..T::NUM_ENTRIES {
        tlb.write(index, 0, 0);
    }
    irq.restore(prior);
}

/// Activates `current`'s address space by flushing the entire TLB, so that
/// no entry belonging to a previous address space survives the switch.
pub fn activate<T: Tlb + ?Sized>(
    current: &mut dyn CurrentAddressSpace,
    tlb: &mut T,
    irq: &mut impl InterruptControl,
) {
    if current.current().is_none() {
        return;
    }
    flush_tlb(tlb, irq);
}

/// Deactivates the current address space. A no-op: the next `activate`
/// flushes the TLB unconditionally.
pub fn deactivate() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoopInterrupts, RecordingTlb, TestFrameArena};

    #[test]
    fn create_has_no_regions_and_no_mapped_pages() {
        let as_ = AddressSpace::create().unwrap();
        assert!(as_.regions().is_empty());
        assert_eq!(as_.heap_top(), VirtAddr::new(0));
        assert_eq!(as_.stack_top(), USERSTACK);
    }

    #[test]
    fn define_region_aligns_and_advances_heap_top() {
        let mut as_ = AddressSpace::create().unwrap();
        as_.define_region(VirtAddr::new(0x0040_0000), 0x2000, RegionFlags::READ | RegionFlags::EXEC)
            .unwrap();
        assert_eq!(as_.regions().len(), 1);
        assert_eq!(as_.heap_top(), VirtAddr::new(0x0040_2000));
    }

    #[test]
    fn define_region_rejects_range_overlapping_stack_window() {
        let mut as_ = AddressSpace::create().unwrap();
        let near_stack = as_.stack_floor();
        let err = as_
            .define_region(near_stack - 0x1000, 0x2000, RegionFlags::READ)
            .unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
    }

    #[test]
    fn define_stack_returns_userstack_and_adds_region() {
        let mut as_ = AddressSpace::create().unwrap();
        let sp = as_.define_stack();
        assert_eq!(sp, USERSTACK);
        assert_eq!(as_.regions().len(), 1);
        assert_eq!(as_.regions()[0].base(), USERSTACK - STACK_MAX_BYTES);
    }

    #[test]
    fn complete_load_flushes_tlb_and_clears_loading_flag() {
        let mut as_ = AddressSpace::create().unwrap();
        as_.prepare_load();
        assert!(as_.is_loading());
        let mut tlb = RecordingTlb::new();
        tlb.write(3, 0xDEAD, 0xBEEF);
        let mut irq = NoopInterrupts::default();
        as_.complete_load(&mut tlb, &mut irq);
        assert!(!as_.is_loading());
        assert!(tlb.entries.iter().all(|e| e.is_none()));
    }

    #[test]
    fn copy_duplicates_present_entries_with_independent_frames() {
        let mut old = AddressSpace::create().unwrap();
        old.define_region(VirtAddr::new(0x0040_0000), 0x1000, RegionFlags::READ | RegionFlags::WRITE)
            .unwrap();

        let mut arena = TestFrameArena::new(4);
        let frame = arena.allocate_frame().unwrap();
        old.page_table.set(
            VirtAddr::new(0x0040_0000),
            PageTableEntry::new(frame, pte::VALID | pte::DIRTY),
        );
        arena.poke(frame, 0, 0xAB);

        let mut new = old
            .copy(&mut arena, &mut arena, &mut arena)
            .expect("copy should succeed with free frames available");

        let new_entry = new.lookup(VirtAddr::new(0x0040_0000));
        assert!(new_entry.is_present());
        assert_ne!(new_entry.phys(), frame);
        assert_eq!(arena.peek(new_entry.phys(), 0), 0xAB);

        arena.poke(new_entry.phys(), 0, 0xCD);
        assert_eq!(arena.peek(frame, 0), 0xAB);

        new.destroy(&mut arena);
        old.destroy(&mut arena);
    }

    #[test]
    fn copy_rolls_back_on_allocator_exhaustion() {
        // Same arena supplies old's existing frames and new's allocations,
        // so the one frame left free after seeding `old` is the only one
        // `copy` can hand out before it runs out.
        let mut arena = TestFrameArena::new(3);
        let a = arena.allocate_frame().unwrap();
        let b = arena.allocate_frame().unwrap();

        let mut old = AddressSpace::create().unwrap();
        old.page_table
            .set(VirtAddr::new(0x0040_0000), PageTableEntry::new(a, pte::VALID));
        old.page_table
            .set(VirtAddr::new(0x0080_0000), PageTableEntry::new(b, pte::VALID));

        let before_free = arena.free_count();
        let result = old.copy(&mut arena, &mut arena, &mut arena);
        assert_eq!(result.unwrap_err(), VmError::OutOfMemory);
        assert_eq!(arena.free_count(), before_free, "rollback must free everything allocated");
    }

    #[test]
    fn destroy_frees_every_present_frame() {
        let mut arena = TestFrameArena::new(4);
        let mut as_ = AddressSpace::create().unwrap();
        let f1 = arena.allocate_frame().unwrap();
        let f2 = arena.allocate_frame().unwrap();
        as_.page_table
            .set(VirtAddr::new(0x0040_0000), PageTableEntry::new(f1, pte::VALID));
        as_.page_table
            .set(VirtAddr::new(0x0080_0000), PageTableEntry::new(f2, pte::VALID));

        let before = arena.free_count();
        as_.destroy(&mut arena);
        assert_eq!(arena.free_count(), before + 2);
    }

    #[test]
    fn activate_flushes_tlb_when_an_address_space_is_bound() {
        struct Single(Option<AddressSpace>);
        impl CurrentAddressSpace for Single {
            fn current(&mut self) -> Option<&mut AddressSpace> {
                self.0.as_mut()
            }
        }

        let mut current = Single(Some(AddressSpace::create().unwrap()));
        let mut tlb = RecordingTlb::new();
        tlb.write(0, 1, 1);
        let mut irq = NoopInterrupts::default();
        activate(&mut current, &mut tlb, &mut irq);
        assert!(tlb.entries.iter().all(|e| e.is_none()));
    }
}
