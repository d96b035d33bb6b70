//! The two-level, demand-paged page table.

use alloc::boxed::Box;

use crate::addr::{ENTRIES_PER_LEVEL, VirtAddr};
use crate::pte::PageTableEntry;

type Level2 = [PageTableEntry; ENTRIES_PER_LEVEL as usize];

/// A sparse, two-level page table indexed by `VirtAddr::level1_index` and
/// `VirtAddr::level2_index`. Top-level slots are absent until the first
/// fault touches an address that falls in their 4 MiB slab.
pub struct PageTable {
    top: Box<[Option<Box<Level2>>; ENTRIES_PER_LEVEL as usize]>,
}

impl PageTable {
    /// Creates an empty page table: every top-level slot absent.
    pub fn new() -> Self {
        Self {
            top: Box::new([const { None }; ENTRIES_PER_LEVEL as usize]),
        }
    }

    /// Looks up the entry for `addr`, without allocating anything.
    /// Returns `PageTableEntry::EMPTY` if the top-level slot or the entry
    /// itself is absent.
    pub fn lookup(&self, addr: VirtAddr) -> PageTableEntry {
        match &self.top[addr.level1_index()] {
            Some(level2) => level2[addr.level2_index()],
            None => PageTableEntry::EMPTY,
        }
    }

    /// Returns the entry for `addr` if its top-level slab exists, allocating
    /// the slab (zero-filled) if it does not. Returns `None` only if the
    /// slab allocation itself fails.
    pub fn entry_or_allocate(&mut self, addr: VirtAddr) -> Option<&mut PageTableEntry> {
        let i = addr.level1_index();
        if self.top[i].is_none() {
            self.top[i] = Some(Box::new([PageTableEntry::EMPTY; ENTRIES_PER_LEVEL as usize]));
        }
        self.top[i].as_mut().map(|level2| &mut level2[addr.level2_index()])
    }

    /// Writes `entry` for `addr`, allocating the second-level slab if needed.
    pub fn set(&mut self, addr: VirtAddr, entry: PageTableEntry) {
        if let Some(slot) = self.entry_or_allocate(addr) {
            *slot = entry;
        }
    }

    /// Iterates over every present entry, yielding `(level1_index, level2_index, entry)`.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, usize, PageTableEntry)> + '_ {
        self.top.iter().enumerate().flat_map(|(i, level2)| {
            level2.iter().flat_map(move |level2| {
                level2
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_present())
                    .map(move |(j, e)| (i, j, *e))
            })
        })
    }

    /// Returns whether the top-level slot for `level1_index` is present.
    pub fn has_level2(&self, level1_index: usize) -> bool {
        self.top[level1_index].is_some()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
