//! Extents: the regions obtained from the backing store, tiled with chunks.
//!
//! ```text
//! region: [ pad | ExtentHeader | chunk | chunk | ... | chunk | fencepost | pad ]
//!                              ^ first_chunk             ^ chunks_end
//! ```
//!
//! The fencepost is an allocated header with the `FENCEPOST` flag, so the chunk
//! walk and coalescing stop at the end of the extent without a bounds check.

use core::{mem::size_of, ptr::NonNull};

use crate::{node::Node, ptr_utils, CHUNK_UNIT};

use super::chunk::{self, FENCEPOST, HEADER_SIZE, MIN_CHUNK_SIZE};

const EXTENT_MAGIC: u32 = u32::from_le_bytes(*b"Extn");

#[derive(Debug)]
#[repr(C)] // ensure the node ptr is the same as the header ptr
pub(crate) struct ExtentHeader {
    pub node: Node,
    /// The region as returned by the backing store.
    pub region_base: *mut u8,
    pub region_size: usize,
    pub chunks_end: *mut u8,
    pub guard: u32,
}

pub(crate) const EXTENT_HEADER_SIZE: usize =
    (size_of::<ExtentHeader>() + CHUNK_UNIT - 1) & !(CHUNK_UNIT - 1);
pub(crate) const FENCEPOST_SIZE: usize = HEADER_SIZE;
/// Bytes an extent needs besides its chunks, including alignment slack at either end.
pub(crate) const EXTENT_OVERHEAD: usize = EXTENT_HEADER_SIZE + FENCEPOST_SIZE + 2 * CHUNK_UNIT;

impl ExtentHeader {
    #[inline]
    pub fn from_node(node: NonNull<Node>) -> NonNull<ExtentHeader> {
        node.cast()
    }

    #[inline]
    pub fn first_chunk(ext: NonNull<ExtentHeader>) -> *mut u8 {
        ext.as_ptr().cast::<u8>().wrapping_add(EXTENT_HEADER_SIZE)
    }

    #[inline]
    pub fn region_end(&self) -> *mut u8 {
        self.region_base.wrapping_add(self.region_size)
    }

    pub fn compute_guard(&self, seed: u32) -> u32 {
        chunk::mix(
            seed,
            self.region_base as usize as u64 ^ (self.chunks_end as usize as u64).rotate_left(17),
            self.region_size as u64,
            EXTENT_MAGIC,
        )
    }

    /// Whether `ptr` lies within the chunks of the extent.
    #[inline]
    pub unsafe fn contains(ext: NonNull<ExtentHeader>, ptr: *const u8) -> bool {
        let first = Self::first_chunk(ext) as usize;
        (first..(*ext.as_ptr()).chunks_end as usize).contains(&(ptr as usize))
    }

    /// Whether the chunk `base..base + size` is the only chunk of the extent.
    #[inline]
    pub unsafe fn is_spanned_by(ext: NonNull<ExtentHeader>, base: *mut u8, size: usize) -> bool {
        base == Self::first_chunk(ext) && base.wrapping_add(size) == (*ext.as_ptr()).chunks_end
    }

    /// Moves the end of the extent down to `chunks_end`, with the region now ending at `region_end`.
    ///
    /// The chunk below the new fencepost must be free.
    pub unsafe fn truncate(ext: NonNull<ExtentHeader>, seed: u32, chunks_end: *mut u8, region_end: *mut u8) {
        let header = &mut *ext.as_ptr();
        header.chunks_end = chunks_end;
        header.region_size = ptr_utils::span_len(header.region_base, region_end);
        header.guard = header.compute_guard(seed);

        write_fencepost(seed, chunks_end, true);
    }
}

#[inline]
pub(crate) unsafe fn write_fencepost(seed: u32, at: *mut u8, prev_free: bool) {
    let flags = if prev_free { FENCEPOST | chunk::PREV_FREE } else { FENCEPOST };
    chunk::write_allocated(seed, at, FENCEPOST_SIZE, flags, 0);
}

/// Lays out a new extent over `region`: the header, one free chunk spanning
/// everything, and the fencepost. The extent is not linked into any list and
/// the free chunk is not registered.
///
/// Returns `None` if the region is too small to hold a minimal chunk.
pub(crate) unsafe fn init(seed: u32, region: NonNull<[u8]>, tag: u32) -> Option<NonNull<ExtentHeader>> {
    let region_base = region.as_ptr().cast::<u8>();
    let region_size = region.len();

    let base = ptr_utils::align_up_by(region_base, CHUNK_UNIT - 1);
    let end = ptr_utils::align_down_by(region_base.wrapping_add(region_size), CHUNK_UNIT - 1);

    if (end as usize) < base as usize + EXTENT_HEADER_SIZE + MIN_CHUNK_SIZE + FENCEPOST_SIZE {
        return None;
    }

    let ext = NonNull::new_unchecked(base.cast::<ExtentHeader>());
    let chunks_end = end.sub(FENCEPOST_SIZE);

    let header = ExtentHeader {
        node: Node { next: None, prev: None },
        region_base,
        region_size,
        chunks_end,
        guard: 0,
    };
    let guard = header.compute_guard(seed);
    ext.as_ptr().write(ExtentHeader { guard, ..header });

    let first = ExtentHeader::first_chunk(ext);
    chunk::write_free(seed, first, ptr_utils::span_len(first, chunks_end), tag);
    write_fencepost(seed, chunks_end, true);

    Some(ext)
}

/// Links `ext` into the address-ordered list at `head`.
pub(crate) unsafe fn link(head: &mut Option<NonNull<Node>>, ext: NonNull<ExtentHeader>) {
    let mut after = None;
    for node in Node::iter(*head) {
        if (node.as_ptr() as usize) > ext.as_ptr() as usize {
            break;
        }
        after = Some(node);
    }

    Node::link_after(head, after, ext.cast());
}

/// Finds the extent whose chunks contain `ptr`.
pub(crate) unsafe fn find(head: Option<NonNull<Node>>, ptr: *const u8) -> Option<NonNull<ExtentHeader>> {
    Node::iter(head)
        .map(ExtentHeader::from_node)
        .take_while(|ext| ext.as_ptr() as usize <= ptr as usize)
        .find(|&ext| ExtentHeader::contains(ext, ptr))
}
