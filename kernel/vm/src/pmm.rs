//! A reference bitmap frame allocator.
//!
//! The VM core treats the physical frame allocator as an out-of-scope
//! collaborator (see [`crate::traits::FrameAllocator`]); this module
//! provides one concrete implementation so the core can be exercised and
//! tested without a real kernel underneath. Production kernels are free to
//! supply their own.

use alloc::vec::Vec;

use tarn_core::sync::SpinLock;

use crate::addr::{PAGE_SIZE, PhysAddr};
use crate::traits::{FrameAllocator, FrameDeallocator};

/// A bitmap-backed frame allocator over a fixed range of physical memory
/// starting at `base`. One bit per frame; `allocate_frame` scans for the
/// first free bit starting from a search hint that advances on every
/// successful allocation, amortizing the scan to O(1) in the common case.
pub struct BitmapAllocator {
    base: PhysAddr,
    frame_count: usize,
    bitmap: Vec<u64>,
    search_hint: usize,
    free_count: usize,
}

impl BitmapAllocator {
    /// Creates an allocator covering `frame_count` frames starting at
    /// `base`, all initially free.
    pub fn new(base: PhysAddr, frame_count: usize) -> Self {
        let words = frame_count.div_ceil(64);
        Self {
            base,
            frame_count,
            bitmap: alloc::vec![0u64; words],
            search_hint: 0,
            free_count: frame_count,
        }
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Total frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.frame_count
    }

    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    fn frame_to_index(&self, frame: PhysAddr) -> usize {
        ((frame.as_u32() - self.base.as_u32()) / PAGE_SIZE) as usize
    }

    fn index_to_frame(&self, index: usize) -> PhysAddr {
        PhysAddr::new(self.base.as_u32() + index as u32 * PAGE_SIZE)
    }
}

unsafe impl FrameAllocator for BitmapAllocator {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        for offset in 0..self.frame_count {
            let index = (self.search_hint + offset) % self.frame_count;
            if !self.is_set(index) {
                self.set(index);
                self.search_hint = (index + 1) % self.frame_count;
                self.free_count -= 1;
                return Some(self.index_to_frame(index));
            }
        }
        None
    }
}

unsafe impl FrameDeallocator for BitmapAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysAddr) {
        let index = self.frame_to_index(frame);
        debug_assert!(self.is_set(index), "double free of physical frame {frame}");
        self.clear(index);
        self.free_count += 1;
    }
}

/// Global instance of the reference allocator, for kernels that want a
/// singleton PMM rather than threading an allocator handle everywhere.
pub static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// Initializes the global allocator to cover `frame_count` frames starting
/// at `base`.
///
/// # Panics
///
/// Panics if the global allocator has already been initialized.
pub fn init(base: PhysAddr, frame_count: usize) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(BitmapAllocator::new(base, frame_count));
}

/// Executes `f` with exclusive access to the global allocator.
///
/// # Panics
///
/// Panics if the global allocator has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}
