//! The free-space index: segregated free lists over every free chunk of every extent.
//!
//! Sizes below [`LINEAR_LIMIT`] get a bin per [`CHUNK_UNIT`] step. Above that,
//! each power of two is divided into four bins. The last bin holds everything
//! larger than the ones below it.
//!
//! A bit per bin tracks which lists are non-empty, so that finding the next
//! candidate list is a single bit scan.

use core::ptr::NonNull;

use crate::{node::Node, ptr_utils, CHUNK_UNIT};

use super::chunk::{self, HEADER_SIZE, MIN_CHUNK_SIZE};

pub(crate) const BIN_COUNT: usize = u64::BITS as usize;

const LINEAR_LIMIT: usize = 512;
const LINEAR_BINS: usize = (LINEAR_LIMIT - MIN_CHUNK_SIZE) / CHUNK_UNIT;
const DIVS_PER_POW2: usize = 4;

/// Which bin a free chunk of `size` bytes belongs to.
#[inline]
pub(crate) fn bin_of(size: usize) -> usize {
    debug_assert!(size >= MIN_CHUNK_SIZE);

    if size < LINEAR_LIMIT {
        return (size - MIN_CHUNK_SIZE) / CHUNK_UNIT;
    }

    let bits = size.ilog2();
    let magnitude = (bits - LINEAR_LIMIT.ilog2()) as usize;
    let division = (size >> (bits - DIVS_PER_POW2.ilog2())) & (DIVS_PER_POW2 - 1);

    (LINEAR_BINS + magnitude * DIVS_PER_POW2 + division).min(BIN_COUNT - 1)
}

/// A free chunk that can hold a requested allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fit {
    pub base: *mut u8,
    pub size: usize,
    /// The (aligned) user pointer. Its header sits at `user - HEADER_SIZE`,
    /// and the gap below that is either empty or large enough to be a free chunk.
    pub user: *mut u8,
}

/// Where the user pointer goes if `required` bytes aligned to `align_mask + 1`
/// are carved from the free chunk `base..base + size`.
#[inline]
pub(crate) fn place(base: *mut u8, size: usize, required: usize, align_mask: usize) -> Option<*mut u8> {
    let mut user = ptr_utils::align_up_by(base.wrapping_add(HEADER_SIZE), align_mask);
    let mut gap = ptr_utils::span_len(base, user) - HEADER_SIZE;

    if gap != 0 && gap < MIN_CHUNK_SIZE {
        user = ptr_utils::align_up_by(base.wrapping_add(HEADER_SIZE + MIN_CHUNK_SIZE), align_mask);
        gap = ptr_utils::span_len(base, user) - HEADER_SIZE;
    }

    match gap.checked_add(required) {
        Some(needed) if needed <= size => Some(user),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) struct FreeIndex {
    avails: u64,
    lists: [Option<NonNull<Node>>; BIN_COUNT],
}

impl FreeIndex {
    pub const fn new() -> Self {
        Self { avails: 0, lists: [None; BIN_COUNT] }
    }

    #[inline]
    pub fn avails(&self) -> u64 {
        self.avails
    }

    #[inline]
    pub fn list(&self, bin: usize) -> Option<NonNull<Node>> {
        self.lists[bin]
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Registers the free chunk at `base`. Its header must already be written.
    #[inline]
    #[track_caller]
    pub unsafe fn insert(&mut self, base: *mut u8, size: usize) {
        debug_assert!(!chunk::read(base).is_allocated());

        let bin = bin_of(size);
        Node::push_front(&mut self.lists[bin], chunk::node(base));
        self.avails |= 1 << bin;
    }

    /// Deregisters the free chunk at `base`.
    #[inline]
    #[track_caller]
    pub unsafe fn remove(&mut self, base: *mut u8, size: usize) {
        let bin = bin_of(size);
        Node::unlink(&mut self.lists[bin], chunk::node(base));

        if self.lists[bin].is_none() {
            self.avails &= !(1 << bin);
        }
    }

    /// Finds the first free chunk, starting at the smallest bin that could hold
    /// `required` bytes, that fits `required` bytes aligned to `align_mask + 1`.
    pub unsafe fn find_fit(&self, required: usize, align_mask: usize) -> Option<Fit> {
        let mut avails = self.avails & (!0u64 << bin_of(required));

        while avails != 0 {
            let bin = avails.trailing_zeros() as usize;

            for node in Node::iter(self.lists[bin]) {
                let base = chunk::node_to_base(node);
                let size = chunk::read(base).size();

                if let Some(user) = place(base, size, required, align_mask) {
                    return Some(Fit { base, size, user });
                }
            }

            avails &= avails - 1;
        }

        None
    }
}
