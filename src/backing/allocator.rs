use core::{fmt::Debug, mem::size_of, ptr::NonNull};

use allocator_api2::alloc::{Allocator, Layout};

use crate::{node::Node, CHUNK_UNIT};

use super::Backing;

/// Source memory from a backing allocator on demand.
///
/// Every expansion is a separate allocation, prefixed with a small header
/// that chains it to the others so they can be released on drop.
/// Only whole regions can be contracted; partial contraction requests are refused.
///
/// # Example
///
/// ```
/// use tagheap::{AllocatorBacking, Heap, HeapConfig};
/// use allocator_api2::alloc::Global;
///
/// let mut heap = Heap::new(AllocatorBacking::new(Global), HeapConfig::new());
/// let allocation = heap.allocate(100, u32::from_le_bytes(*b"Test"));
/// assert!(allocation.is_some());
/// ```
#[derive(Debug)]
pub struct AllocatorBacking<A: Allocator> {
    allocator: A,
    blocks: Option<NonNull<Node>>,
}

#[repr(C)] // ensure the node ptr is the same as the header ptr
struct BlockHeader {
    node: Node,
    layout_size: usize,
}

const BLOCK_HEADER_SIZE: usize = (size_of::<BlockHeader>() + CHUNK_UNIT - 1) & !(CHUNK_UNIT - 1);
const BLOCK_ALIGN: usize = CHUNK_UNIT;

impl<A: Allocator> AllocatorBacking<A> {
    /// Create a new [`AllocatorBacking`] with the given allocator.
    pub const fn new(allocator: A) -> Self {
        Self { allocator, blocks: None }
    }

    /// The backing allocator.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Number of regions currently held.
    pub fn region_count(&self) -> usize {
        unsafe { Node::iter(self.blocks).count() }
    }

    unsafe fn release(&mut self, node: NonNull<Node>) {
        let header = node.as_ptr().cast::<BlockHeader>();
        let layout = Layout::from_size_align_unchecked((*header).layout_size, BLOCK_ALIGN);

        Node::unlink(&mut self.blocks, node);
        self.allocator.deallocate(node.cast(), layout);
    }
}

unsafe impl<A: Allocator + Debug> Backing for AllocatorBacking<A> {
    fn expand(&mut self, size: usize, tag: u32) -> Option<NonNull<[u8]>> {
        let layout_size = size.checked_add(BLOCK_HEADER_SIZE)?;
        let layout = Layout::from_size_align(layout_size, BLOCK_ALIGN).ok()?;

        let base = self.allocator.allocate(layout).ok()?.cast::<u8>();

        log::trace!("allocator backing: expand {:#x} bytes at {:p} for tag {:#010x}", size, base, tag);

        unsafe {
            let node = base.cast::<Node>();
            Node::push_front(&mut self.blocks, node);
            (*base.as_ptr().cast::<BlockHeader>()).layout_size = layout_size;

            let region = NonNull::new_unchecked(base.as_ptr().add(BLOCK_HEADER_SIZE));
            Some(NonNull::slice_from_raw_parts(region, size))
        }
    }

    unsafe fn contract(&mut self, base: NonNull<u8>, size: usize) -> bool {
        for node in Node::iter(self.blocks) {
            let region = node.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE);
            if region != base.as_ptr() {
                continue;
            }

            let layout_size = (*node.as_ptr().cast::<BlockHeader>()).layout_size;
            if layout_size - BLOCK_HEADER_SIZE != size {
                log::trace!("allocator backing: refusing partial contraction of {:p}", base);
                return false;
            }

            log::trace!("allocator backing: contract {:#x} bytes at {:p}", size, base);
            self.release(node);
            return true;
        }

        false
    }
}

impl<A: Allocator> Drop for AllocatorBacking<A> {
    fn drop(&mut self) {
        while let Some(node) = self.blocks {
            unsafe { self.release(node) };
        }
    }
}

// the chain only references memory this backing owns exclusively
unsafe impl<A: Allocator + Send> Send for AllocatorBacking<A> {}
