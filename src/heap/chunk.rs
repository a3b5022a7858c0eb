//! Chunk metadata layout and the guard values that protect it.
//!
//! Every chunk starts with a [`Header`] immediately below the pointer handed to the user.
//! Free chunks additionally hold a free-list [`Node`] just above the header and a [`Footer`]
//! in their last bytes, so that the chunk above a free chunk can find its base.
//!
//! ```text
//! allocated: [ header | user memory .................................... ]
//! free:      [ header | node | ...................................| footer ]
//! ```
//!
//! All pointer arithmetic on chunk metadata happens in this module.

use core::{mem::size_of, ptr::NonNull};

use crate::{node::Node, CHUNK_UNIT};

pub(crate) const HEADER_SIZE: usize = CHUNK_UNIT;
pub(crate) const FOOTER_SIZE: usize = CHUNK_UNIT;
/// Header, free-list node and footer.
pub(crate) const MIN_CHUNK_SIZE: usize = HEADER_SIZE + CHUNK_UNIT + FOOTER_SIZE;

pub(crate) const ALLOCATED: usize = 1 << 0;
/// The chunk directly below is free, and its footer is valid.
pub(crate) const PREV_FREE: usize = 1 << 1;
/// The chunk is a direct block, not part of any extent.
pub(crate) const DIRECT: usize = 1 << 2;
/// The allocated sentinel marking the end of an extent's chunks.
pub(crate) const FENCEPOST: usize = 1 << 3;

const FLAGS_MASK: usize = CHUNK_UNIT - 1;

/// Salt mixed into the guards of allocated chunks.
pub(crate) const ALLOCATED_MAGIC: u32 = u32::from_le_bytes(*b"Pool");
/// Salt mixed into the guards of free chunks.
pub(crate) const FREE_MAGIC: u32 = u32::from_le_bytes(*b"Free");

const _: () = assert!(size_of::<Header>() <= HEADER_SIZE);
const _: () = assert!(size_of::<Footer>() <= FOOTER_SIZE);
const _: () = assert!(size_of::<Node>() <= CHUNK_UNIT);
const _: () = assert!(FENCEPOST < CHUNK_UNIT);

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Header {
    pub size_and_flags: usize,
    pub tag: u32,
    pub guard: u32,
}

impl Header {
    #[inline]
    pub fn size(&self) -> usize {
        self.size_and_flags & !FLAGS_MASK
    }

    #[inline]
    pub fn flags(&self) -> usize {
        self.size_and_flags & FLAGS_MASK
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.size_and_flags & ALLOCATED != 0
    }

    #[inline]
    pub fn is_prev_free(&self) -> bool {
        self.size_and_flags & PREV_FREE != 0
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.size_and_flags & DIRECT != 0
    }

    #[inline]
    pub fn is_fencepost(&self) -> bool {
        self.size_and_flags & FENCEPOST != 0
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Footer {
    pub size: usize,
    pub guard: u32,
}

/// Computes the guard for the chunk at `base`.
///
/// `PREV_FREE` does not take part, as it changes whenever the chunk below does.
#[inline]
pub(crate) fn guard(seed: u32, base: *const u8, size_and_flags: usize) -> u32 {
    let state = size_and_flags & !PREV_FREE;
    let magic = if state & ALLOCATED != 0 { ALLOCATED_MAGIC } else { FREE_MAGIC };

    mix(seed, base as usize as u64, state as u64, magic)
}

/// A 64-bit finalizer over the inputs, folded to 32 bits.
#[inline]
pub(crate) fn mix(seed: u32, a: u64, b: u64, magic: u32) -> u32 {
    let mut x = a ^ b.rotate_left(29) ^ ((seed as u64) << 32 | magic as u64);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    (x ^ (x >> 32)) as u32
}

#[inline]
pub(crate) unsafe fn header(base: *mut u8) -> *mut Header {
    base.cast()
}
#[inline]
pub(crate) unsafe fn footer(end: *mut u8) -> *mut Footer {
    end.sub(FOOTER_SIZE).cast()
}
#[inline]
pub(crate) unsafe fn node(base: *mut u8) -> NonNull<Node> {
    NonNull::new_unchecked(base.add(HEADER_SIZE).cast())
}
#[inline]
pub(crate) unsafe fn node_to_base(node: NonNull<Node>) -> *mut u8 {
    node.as_ptr().cast::<u8>().sub(HEADER_SIZE)
}
#[inline]
pub(crate) fn user_to_base(ptr: *mut u8) -> *mut u8 {
    ptr.wrapping_sub(HEADER_SIZE)
}
#[inline]
pub(crate) unsafe fn base_to_user(base: *mut u8) -> NonNull<u8> {
    NonNull::new_unchecked(base.add(HEADER_SIZE))
}

/// Reads the header of the chunk at `base`.
#[inline]
pub(crate) unsafe fn read(base: *mut u8) -> Header {
    header(base).read()
}

/// Whether the guard of the chunk at `base` matches its current header.
#[inline]
pub(crate) unsafe fn guard_ok(seed: u32, base: *mut u8) -> bool {
    let h = read(base);
    h.guard == guard(seed, base, h.size_and_flags)
}

/// Whether the free chunk at `base` has a footer agreeing with its header.
#[inline]
pub(crate) unsafe fn footer_ok(base: *mut u8, h: &Header) -> bool {
    let f = footer(base.add(h.size())).read();
    f.size == h.size() && f.guard == h.guard
}

/// Writes the header of an allocated chunk. `flags` may add `PREV_FREE`, `DIRECT` or `FENCEPOST`.
#[inline]
#[track_caller]
pub(crate) unsafe fn write_allocated(seed: u32, base: *mut u8, size: usize, flags: usize, tag: u32) {
    debug_assert!(size & FLAGS_MASK == 0);
    debug_assert!(flags & !FLAGS_MASK == 0);

    let size_and_flags = size | flags | ALLOCATED;
    header(base).write(Header { size_and_flags, tag, guard: guard(seed, base, size_and_flags) });
}

/// Writes the header and footer of a free chunk.
///
/// A free chunk never borders another free chunk from above, so `PREV_FREE` is left clear.
#[inline]
#[track_caller]
pub(crate) unsafe fn write_free(seed: u32, base: *mut u8, size: usize, tag: u32) {
    debug_assert!(size >= MIN_CHUNK_SIZE);
    debug_assert!(size & FLAGS_MASK == 0);

    let guard = guard(seed, base, size);
    header(base).write(Header { size_and_flags: size, tag, guard });
    footer(base.add(size)).write(Footer { size, guard });
}

/// Marks the header of a chunk that was merged into a neighbour as freed.
///
/// The header stays guarded, so a later free through it is caught as a double free,
/// but its size is zero, so it can never be mistaken for a live or indexed chunk.
#[inline]
pub(crate) unsafe fn write_absorbed(seed: u32, base: *mut u8, tag: u32) {
    header(base).write(Header { size_and_flags: 0, tag, guard: guard(seed, base, 0) });
}

/// Sets or clears `PREV_FREE` on the chunk at `base`, leaving its guard valid.
#[inline]
pub(crate) unsafe fn set_prev_free(base: *mut u8, prev_free: bool) {
    let h = header(base);
    if prev_free {
        (*h).size_and_flags |= PREV_FREE;
    } else {
        (*h).size_and_flags &= !PREV_FREE;
    }
}

/// The base of the free chunk below `base`, found through its footer.
///
/// The chunk at `base` must have `PREV_FREE` set.
#[inline]
pub(crate) unsafe fn prev_free_base(base: *mut u8) -> *mut u8 {
    base.sub((*footer(base)).size)
}

/// The chunk size needed to hold `size` user bytes, or `None` on overflow.
#[inline]
pub(crate) const fn required_chunk_size(size: usize) -> Option<usize> {
    match crate::ptr_utils::checked_align_size(size, CHUNK_UNIT - 1) {
        Some(aligned) => match aligned.checked_add(HEADER_SIZE) {
            Some(size) if size < MIN_CHUNK_SIZE => Some(MIN_CHUNK_SIZE),
            other => other,
        },
        None => None,
    }
}
