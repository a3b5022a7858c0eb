//! The direct path: allocations at or above the configured threshold get a
//! region from the backing store each, returned as soon as they are freed.
//!
//! ```text
//! region: [ pad | DirectHeader | chunk header | user memory ... | pad ]
//! ```
//!
//! The chunk header carries the `DIRECT` flag, and its size spans up to the
//! end of the region, so `free` and the validator treat it like any other chunk.

use core::{mem::size_of, ptr::NonNull};

use super::{chunk, Heap};
use crate::{node::Node, ptr_utils, Backing, CHUNK_UNIT};

use chunk::{DIRECT, HEADER_SIZE};

const DIRECT_MAGIC: u32 = u32::from_le_bytes(*b"Drct");

#[derive(Debug)]
#[repr(C)] // ensure the node ptr is the same as the header ptr
pub(crate) struct DirectHeader {
    pub node: Node,
    /// The region as returned by the backing store.
    pub region_base: *mut u8,
    pub region_size: usize,
    /// The size requested by the user.
    pub size: usize,
    pub guard: u32,
}

pub(crate) const DIRECT_HEADER_SIZE: usize =
    (size_of::<DirectHeader>() + CHUNK_UNIT - 1) & !(CHUNK_UNIT - 1);

impl DirectHeader {
    pub fn compute_guard(&self, seed: u32) -> u32 {
        chunk::mix(
            seed,
            self.region_base as usize as u64 ^ (self.region_size as u64).rotate_left(23),
            self.size as u64,
            DIRECT_MAGIC,
        )
    }

    #[inline]
    pub fn chunk_base(block: NonNull<DirectHeader>) -> *mut u8 {
        block.as_ptr().cast::<u8>().wrapping_add(DIRECT_HEADER_SIZE)
    }

    #[inline]
    pub fn region_end(&self) -> *mut u8 {
        self.region_base.wrapping_add(self.region_size)
    }
}

/// Finds the direct block whose user pointer is `ptr`.
pub(crate) unsafe fn find(head: Option<NonNull<Node>>, ptr: *mut u8) -> Option<NonNull<DirectHeader>> {
    Node::iter(head)
        .map(NonNull::cast::<DirectHeader>)
        .find(|&block| DirectHeader::chunk_base(block).wrapping_add(HEADER_SIZE) == ptr)
}

impl<B: Backing> Heap<B> {
    /// Allocate `size` bytes aligned to `align_mask + 1` in a region of their own.
    pub(super) fn allocate_direct(&mut self, size: usize, tag: u32, align_mask: usize) -> Option<NonNull<u8>> {
        let seed = self.seed();

        let request = size
            .checked_add(DIRECT_HEADER_SIZE + HEADER_SIZE + CHUNK_UNIT)?
            .checked_add(align_mask)?;
        let request = ptr_utils::checked_align_size(request, self.config.granularity_mask())?;

        let region = self.backing.expand(request, tag)?;
        let region_base = region.as_ptr().cast::<u8>();
        let region_size = region.len();
        let region_end = region_base.wrapping_add(region_size);

        let user = ptr_utils::align_up_by(region_base.wrapping_add(DIRECT_HEADER_SIZE + HEADER_SIZE), align_mask);
        let base = chunk::user_to_base(user);
        let capacity_end = ptr_utils::align_down_by(region_end, CHUNK_UNIT - 1);

        if (capacity_end as usize) < user as usize + size {
            // the backing store gave less than asked for
            if !unsafe { self.backing.contract(region.cast(), region_size) } {
                log::warn!("heap: backing store refused to take back an unusable region");
            }
            return None;
        }

        unsafe {
            let block = NonNull::new_unchecked(base.sub(DIRECT_HEADER_SIZE).cast::<DirectHeader>());

            let header = DirectHeader {
                node: Node { next: None, prev: None },
                region_base,
                region_size,
                size,
                guard: 0,
            };
            let guard = header.compute_guard(seed);
            block.as_ptr().write(DirectHeader { guard, ..header });
            Node::push_front(&mut self.directs, block.cast());

            chunk::write_allocated(seed, base, ptr_utils::span_len(base, capacity_end), DIRECT, tag);

            self.statistics.account_expand(region_size);
            log::trace!("heap: direct allocation of {:#x} bytes at {:p}", size, user);

            Some(NonNull::new_unchecked(user))
        }
    }

    /// Free a live direct block, handing its region back to the backing store.
    pub(super) unsafe fn free_direct(&mut self, block: NonNull<DirectHeader>) {
        let seed = self.seed();
        let base = DirectHeader::chunk_base(block);
        let h = chunk::read(base);
        let DirectHeader { region_base, region_size, size, .. } = *block.as_ptr();

        self.account_tag_free(h.tag, h.size() - HEADER_SIZE);
        self.statistics.account_direct_free(size);

        Node::unlink(&mut self.directs, block.cast());

        if self.backing.contract(NonNull::new_unchecked(region_base), region_size) {
            self.statistics.account_contract(region_size);
            log::trace!("heap: released direct block at {:p}", region_base);
        } else {
            // whole regions are expected to always be taken back,
            // keep the block around in the free state until the heap is destroyed
            log::error!("heap: backing store refused direct block at {:p} ({:#x} bytes)", region_base, region_size);

            let size_and_flags = h.size() | DIRECT;
            chunk::header(base).write(chunk::Header {
                size_and_flags,
                tag: h.tag,
                guard: chunk::guard(seed, base, size_and_flags),
            });
            Node::push_front(&mut self.directs, block.cast());
        }
    }

    /// Resize a direct block without moving it. Returns `false` if it doesn't fit.
    pub(super) unsafe fn resize_direct_in_place(&mut self, block: NonNull<DirectHeader>, new_size: usize, tag: u32) -> bool {
        let seed = self.seed();
        let base = DirectHeader::chunk_base(block);
        let h = chunk::read(base);

        if new_size > h.size() - HEADER_SIZE {
            return false;
        }

        let header = &mut *block.as_ptr();
        self.statistics.direct_allocation_size -= header.size;
        self.statistics.direct_allocation_size += new_size;
        header.size = new_size;
        header.guard = header.compute_guard(seed);

        chunk::write_allocated(seed, base, h.size(), DIRECT, tag);
        self.account_tag_resize(h, tag, h.size());

        true
    }
}
