use core::ptr::NonNull;

use super::Backing;

/// Hands out memory from one fixed region, bottom to top.
///
/// Suitable for freestanding environments with a single static heap area.
/// Contraction succeeds only for ranges that end at the current top of the
/// handed-out area, which lowers the top again. Tail trims of the most
/// recent extent therefore succeed, anything below it is refused.
///
/// # Example
///
/// ```
/// use tagheap::{Heap, HeapConfig, RegionBacking};
///
/// static mut ARENA: [u8; 0x4000] = [0; 0x4000];
///
/// let backing = unsafe { RegionBacking::array(&raw mut ARENA) };
/// let mut heap = Heap::new(backing, HeapConfig::new().with_minimum_extent_size(0x1000));
/// assert!(heap.allocate(0x100, 0).is_some());
/// ```
#[derive(Debug)]
pub struct RegionBacking {
    base: *mut u8,
    top: *mut u8,
    end: *mut u8,
}

unsafe impl Send for RegionBacking {}

impl RegionBacking {
    /// Create a new [`RegionBacking`] over `base..base + size`.
    ///
    /// # Safety
    /// The memory must be valid for reads and writes, and otherwise unused,
    /// for as long as the backing or a heap using it is alive.
    #[inline]
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, top: base, end: base.wrapping_add(size) }
    }

    /// Create a new [`RegionBacking`] from an array.
    ///
    /// # Safety
    /// See [`RegionBacking::new`].
    #[inline]
    pub const unsafe fn array<T, const N: usize>(array: *mut [T; N]) -> Self {
        Self::new(array.cast(), N * core::mem::size_of::<T>())
    }

    /// Bytes currently handed out.
    #[inline]
    pub fn used(&self) -> usize {
        self.top as usize - self.base as usize
    }

    /// Bytes still available.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end as usize - self.top as usize
    }
}

unsafe impl Backing for RegionBacking {
    fn expand(&mut self, size: usize, tag: u32) -> Option<NonNull<[u8]>> {
        if size == 0 || size > self.remaining() {
            log::trace!("region backing: cannot expand by {:#x} for tag {:#010x}", size, tag);
            return None;
        }

        let base = NonNull::new(self.top)?;
        self.top = self.top.wrapping_add(size);

        Some(NonNull::slice_from_raw_parts(base, size))
    }

    unsafe fn contract(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let base = base.as_ptr();

        if base.wrapping_add(size) != self.top || (base as usize) < self.base as usize {
            return false;
        }

        self.top = base;
        true
    }
}
