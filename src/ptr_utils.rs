//! Generic utilities for pointer handling and sizing.

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // keeps the provenance of `ptr` while letting the compiler see through the arithmetic
    ptr.wrapping_add(((ptr as usize).wrapping_add(align_mask) & !align_mask) - ptr as usize)
}

/// Aligns `ptr` down to `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_down_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    ptr.wrapping_sub(ptr as usize & align_mask)
}

/// Rounds `size` up to a multiple of `align_mask + 1`, returning `None` on overflow.
#[inline]
pub const fn checked_align_size(size: usize, align_mask: usize) -> Option<usize> {
    match size.checked_add(align_mask) {
        Some(sum) => Some(sum & !align_mask),
        None => None,
    }
}

#[inline]
pub fn is_aligned_to(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) & (align - 1) == 0
}

/// Number of bytes from `lo` up to `hi`. `hi` must not be below `lo`.
#[inline]
pub fn span_len(lo: *const u8, hi: *const u8) -> usize {
    debug_assert!(lo as usize <= hi as usize);
    hi as usize - lo as usize
}
