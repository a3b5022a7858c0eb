//! Backing stores supply the memory a [`Heap`](crate::Heap) carves allocations from.

use core::{fmt::Debug, ptr::NonNull};

use crate::CorruptionCode;

mod allocator;
mod region;

pub use allocator::AllocatorBacking;
pub use region::RegionBacking;

/// Source and reclaim regions of memory for a [`Heap`](crate::Heap), and receive
/// its corruption reports.
///
/// The heap owns its backing as the public `backing` field and calls into it
/// while an operation is in progress. The backing only ever sees itself, never the heap.
///
/// # Safety
///
/// Regions returned by [`Backing::expand`] must be valid for reads and writes,
/// must not overlap any other region handed out and not yet contracted,
/// and must stay valid until passed back to [`Backing::contract`] or until the
/// backing is dropped.
///
/// Do not use the heap being served, directly or via the global allocator,
/// from within these methods. A [`HeapLock`](crate::sync::HeapLock) will deadlock.
pub unsafe trait Backing: Debug {
    /// Provide a region of at least `size` bytes, or `None` if no more memory is available.
    ///
    /// `tag` is the tag of the allocation that caused the expansion.
    fn expand(&mut self, size: usize, tag: u32) -> Option<NonNull<[u8]>>;

    /// Take back `size` bytes at `base`.
    ///
    /// `base..base + size` is either a whole region returned by [`Backing::expand`]
    /// or, unless [`HeapFlags::NO_PARTIAL_FREES`](crate::HeapFlags::NO_PARTIAL_FREES)
    /// is set, the tail end of one. Returns whether the memory was taken back;
    /// refusing is always allowed, in which case the heap keeps using the memory.
    ///
    /// # Safety
    /// The heap no longer references any memory in the range.
    unsafe fn contract(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// Called for every corruption the heap detects.
    ///
    /// The default implementation logs the event.
    fn on_corruption(&mut self, code: CorruptionCode, location: *const u8) {
        log::error!("heap corruption: {} at {:p}", code, location);
    }
}

/// Does not provide or reclaim memory.
///
/// Every expansion fails, so a heap using this can't allocate anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NoBacking;

// SAFETY: never hands out memory.
unsafe impl Backing for NoBacking {
    #[inline]
    fn expand(&mut self, _size: usize, _tag: u32) -> Option<NonNull<[u8]>> {
        None
    }

    #[inline]
    unsafe fn contract(&mut self, _base: NonNull<u8>, _size: usize) -> bool {
        false
    }
}
