//! This module provides the allocation engine via the [`Heap`] type.

use core::{fmt::Debug, ptr::NonNull};

use crate::{
    node::Node, ptr_utils, Backing, CorruptionCode, HeapConfig, HeapError, HeapFlags, CHUNK_UNIT,
};

use bins::FreeIndex;
use chunk::{Header, HEADER_SIZE, MIN_CHUNK_SIZE, PREV_FREE};
use direct::DirectHeader;
use extent::{ExtentHeader, EXTENT_OVERHEAD, FENCEPOST_SIZE};
use tags::TagTable;

pub(crate) mod bins;
pub(crate) mod chunk;
mod direct;
mod extent;
mod stats;
mod tags;
mod validate;

pub use stats::Statistics;
pub use tags::{TagName, TagStatistics, STATISTICS_TAG};

/// Marks a heap that has not been destroyed.
const HEAP_MAGIC: u32 = u32::from_le_bytes(*b"Heap");

/// A heap allocator over memory obtained from a [`Backing`].
///
/// [`Heap`] does not exhibit interior mutability and does no locking.
/// Every operation needs a mutable reference, so callers sharing a heap
/// must serialize access, e.g. with [`HeapLock`](crate::sync::HeapLock).
///
/// Memory is obtained lazily: no call to [`Backing::expand`] is made until
/// the first allocation needs it.
///
/// # Example
///
/// ```
/// use tagheap::{AllocatorBacking, Heap, HeapConfig};
/// use allocator_api2::alloc::Global;
///
/// let mut heap = Heap::new(AllocatorBacking::new(Global), HeapConfig::new());
///
/// let ptr = heap.allocate(64, u32::from_le_bytes(*b"Docs")).unwrap();
/// let ptr = unsafe { heap.reallocate(ptr.as_ptr(), 128, 0) }.unwrap();
/// unsafe { heap.free(ptr.as_ptr()) };
///
/// assert!(heap.validate());
/// heap.destroy();
/// ```
pub struct Heap<B: Backing> {
    /// The backing store.
    ///
    /// The heap calls into it to expand and contract, and reports corruption to it.
    /// It is otherwise left alone, so it may be accessed freely between operations.
    pub backing: B,

    config: HeapConfig,
    magic: u32,

    index: FreeIndex,
    extents: Option<NonNull<Node>>,
    directs: Option<NonNull<Node>>,

    statistics: Statistics,
    tags: TagTable,
    operations_since_validation: u32,
}

unsafe impl<B: Backing + Send> Send for Heap<B> {}

impl<B: Backing> Debug for Heap<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("backing", &self.backing)
            .field("config", &self.config)
            .field("live", &self.is_live())
            .field("availability", &format_args!("{:#066b}", self.index.avails()))
            .field("statistics", &self.statistics)
            .finish()
    }
}

/// A pointer passed to `free` or `reallocate`, found to be a live allocation.
#[derive(Debug, Clone, Copy)]
enum Block {
    Chunk { ext: NonNull<ExtentHeader>, base: *mut u8 },
    Direct { block: NonNull<DirectHeader> },
}

impl<B: Backing> Heap<B> {
    /// Creates a new, empty heap.
    ///
    /// No memory is requested from `backing` until it is needed.
    pub const fn new(backing: B, config: HeapConfig) -> Self {
        Self {
            backing,
            config,
            magic: HEAP_MAGIC,
            index: FreeIndex::new(),
            extents: None,
            directs: None,
            statistics: Statistics::new(),
            tags: TagTable::new(),
            operations_since_validation: 0,
        }
    }

    /// The configuration the heap was created with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Whether [`Heap::destroy`] has not been called yet.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.magic == HEAP_MAGIC
    }

    #[inline]
    fn seed(&self) -> u32 {
        self.config.heap_seed
    }

    #[inline]
    fn is_direct(&self, size: usize) -> bool {
        self.config.direct_allocation_threshold != 0 && size >= self.config.direct_allocation_threshold
    }

    #[inline]
    fn report(&mut self, code: CorruptionCode, location: *const u8) {
        self.backing.on_corruption(code, location);
    }

    /// Allocate `size` bytes, aligned to [`CHUNK_UNIT`].
    ///
    /// `tag` is kept with the allocation for diagnostics and tag statistics.
    /// A `size` of zero yields a unique pointer that can be freed as usual.
    ///
    /// Returns `None` if the backing store cannot provide the memory.
    pub fn allocate(&mut self, size: usize, tag: u32) -> Option<NonNull<u8>> {
        let allocation = self.allocate_accounted(size, tag, CHUNK_UNIT - 1);
        self.after_operation();
        allocation
    }

    /// Allocate `size` bytes aligned to `alignment`.
    ///
    /// Alignments below [`CHUNK_UNIT`] are raised to it.
    ///
    /// # Errors
    /// - [`HeapError::InvalidAlignment`] if `alignment` is not a power of two.
    /// - [`HeapError::OutOfMemory`] if the backing store cannot provide the memory.
    pub fn aligned_allocate(
        &mut self,
        alignment: usize,
        size: usize,
        tag: u32,
    ) -> Result<NonNull<u8>, HeapError> {
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment { alignment });
        }

        let align_mask = alignment.max(CHUNK_UNIT) - 1;
        let allocation = self
            .allocate_accounted(size, tag, align_mask)
            .ok_or(HeapError::OutOfMemory { size, alignment });

        self.after_operation();
        allocation
    }

    /// Free an allocation.
    ///
    /// A null `ptr` is ignored. Double frees and pointers this heap did not hand out
    /// are reported through [`Backing::on_corruption`] where detected, and otherwise ignored.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap and not freed since.
    /// Detection of violations is best-effort, not a guarantee.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        if let Some(block) = self.resolve(ptr) {
            self.free_block(block);
        }

        self.after_operation();
    }

    /// Resize an allocation to `new_size` bytes, moving it if necessary.
    ///
    /// - A null `ptr` allocates.
    /// - A `new_size` of zero frees `ptr` and returns `None`.
    /// - If a new allocation is needed but cannot be made, `None` is returned
    ///     and the original allocation is left untouched.
    ///
    /// The first `min(old size, new_size)` bytes are preserved. An alignment beyond
    /// [`CHUNK_UNIT`] is not preserved if the allocation moves.
    ///
    /// # Safety
    /// `ptr` must be null or have been returned by this heap and not freed since.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize, tag: u32) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(new_size, tag);
        }
        if new_size == 0 {
            self.free(ptr);
            return None;
        }

        let allocation = self.reallocate_inner(ptr, new_size, tag);
        self.after_operation();
        allocation
    }

    /// Returns the number of bytes usable at `ptr`.
    ///
    /// This may exceed the size requested.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.chunk_usable_size(ptr)
    }

    #[inline]
    unsafe fn chunk_usable_size(&self, ptr: NonNull<u8>) -> usize {
        chunk::read(chunk::user_to_base(ptr.as_ptr())).size() - HEADER_SIZE
    }

    /// Allocate, updating the statistics of either path and the tag statistics.
    fn allocate_accounted(&mut self, size: usize, tag: u32, align_mask: usize) -> Option<NonNull<u8>> {
        if !self.is_live() {
            log::warn!("heap: allocation from a destroyed heap");
            return None;
        }

        let allocation = if self.is_direct(size) {
            let allocation = self.allocate_direct(size, tag, align_mask);
            if allocation.is_some() {
                self.statistics.account_direct_alloc(size);
            }
            allocation
        } else {
            let allocation = self.allocate_chunk(size, tag, align_mask);
            if allocation.is_some() {
                self.statistics.account_alloc();
            }
            allocation
        };

        match allocation {
            Some(ptr) => {
                let usable = unsafe { self.chunk_usable_size(ptr) };
                self.account_tag_alloc(tag, usable);
            }
            None => self.statistics.account_failure(),
        }

        allocation
    }

    /// Carve an allocation out of the free chunks, expanding once if none fit.
    ///
    /// No counters but the free list's and the heap size are touched.
    pub(crate) fn allocate_chunk(&mut self, size: usize, tag: u32, align_mask: usize) -> Option<NonNull<u8>> {
        let required = chunk::required_chunk_size(size)?;

        unsafe {
            let fit = match self.index.find_fit(required, align_mask) {
                Some(fit) => fit,
                None => {
                    self.expand(required, align_mask, tag)?;
                    self.index.find_fit(required, align_mask)?
                }
            };

            Some(self.carve(fit, required, tag))
        }
    }

    /// Obtain a new extent large enough for a chunk of `required` bytes aligned to `align_mask + 1`.
    fn expand(&mut self, required: usize, align_mask: usize, tag: u32) -> Option<()> {
        let mut size = required.checked_add(EXTENT_OVERHEAD)?;
        if align_mask >= CHUNK_UNIT {
            size = size.checked_add(align_mask + MIN_CHUNK_SIZE)?;
        }
        let size = size.max(self.config.minimum_extent_size);
        let size = ptr_utils::checked_align_size(size, self.config.granularity_mask())?;

        let region = self.backing.expand(size, tag)?;
        log::trace!("heap: expanded by {:#x} bytes at {:p}", region.len(), region.as_ptr());

        unsafe {
            let Some(ext) = extent::init(self.seed(), region, tag) else {
                // too small to be of any use
                if !self.backing.contract(region.cast(), region.len()) {
                    log::warn!("heap: backing store refused to take back an unusable region");
                }
                return None;
            };

            extent::link(&mut self.extents, ext);
            self.statistics.account_expand(region.len());
            self.statistics.extent_count += 1;

            let first = ExtentHeader::first_chunk(ext);
            let first_size = chunk::read(first).size();
            self.register_free(first, first_size);

            log::debug!("heap: new extent at {:p} with {:#x} bytes of chunks", ext, first_size);
        }

        Some(())
    }

    /// Allocate `required` bytes out of the free chunk described by `fit`,
    /// splitting off the gap below and the excess above as free chunks.
    unsafe fn carve(&mut self, fit: bins::Fit, required: usize, tag: u32) -> NonNull<u8> {
        let seed = self.seed();
        self.deregister_free(fit.base, fit.size);

        let free_tag = chunk::read(fit.base).tag;
        let base = chunk::user_to_base(fit.user);
        let mut size = fit.size;
        let mut flags = 0;

        if base != fit.base {
            let gap = ptr_utils::span_len(fit.base, base);
            chunk::write_free(seed, fit.base, gap, free_tag);
            self.register_free(fit.base, gap);

            size -= gap;
            flags = PREV_FREE;
        }

        if size - required >= MIN_CHUNK_SIZE {
            // the chunk above already has PREV_FREE set
            let rest = base.add(required);
            chunk::write_free(seed, rest, size - required, free_tag);
            self.register_free(rest, size - required);
            size = required;
        } else {
            chunk::set_prev_free(base.add(size), false);
        }

        chunk::write_allocated(seed, base, size, flags, tag);
        chunk::base_to_user(base)
    }

    /// Find out what `ptr` points to, reporting it if it's not a live allocation,
    /// or if the chunks around it are damaged.
    unsafe fn resolve(&mut self, ptr: *mut u8) -> Option<Block> {
        let seed = self.seed();
        let base = chunk::user_to_base(ptr);

        if !ptr_utils::is_aligned_to(ptr, CHUNK_UNIT) {
            self.report(CorruptionCode::InvalidFree, ptr);
            return None;
        }

        if let Some(ext) = extent::find(self.extents, base) {
            if (*ext.as_ptr()).guard != (*ext.as_ptr()).compute_guard(seed) {
                self.report(CorruptionCode::BadExtent, ext.as_ptr().cast());
                return None;
            }

            let h = chunk::read(base);
            let chunks_end = (*ext.as_ptr()).chunks_end;

            if h.guard != chunk::guard(seed, base, h.size_and_flags)
                || h.is_direct()
                || h.is_fencepost()
                || h.size() > ptr_utils::span_len(base, chunks_end)
            {
                self.report(CorruptionCode::InvalidFree, ptr);
                return None;
            }
            if !h.is_allocated() {
                self.report(CorruptionCode::DoubleFree, ptr);
                return None;
            }

            let next = base.add(h.size());
            if !chunk::guard_ok(seed, next) {
                self.report(CorruptionCode::BufferOverrun, next);
                return None;
            }
            if h.is_prev_free() {
                let prev = chunk::prev_free_base(base);
                let prev_ok = (prev as usize) >= ExtentHeader::first_chunk(ext) as usize
                    && chunk::guard_ok(seed, prev)
                    && !chunk::read(prev).is_allocated();

                if !prev_ok {
                    self.report(CorruptionCode::CorruptedChunk, prev);
                    return None;
                }
            }

            return Some(Block::Chunk { ext, base });
        }

        if let Some(block) = direct::find(self.directs, ptr) {
            let h = chunk::read(base);

            if h.guard != chunk::guard(seed, base, h.size_and_flags) || !h.is_direct() {
                self.report(CorruptionCode::InvalidFree, ptr);
                return None;
            }
            if !h.is_allocated() {
                self.report(CorruptionCode::DoubleFree, ptr);
                return None;
            }
            // the region it describes is about to be handed back
            if (*block.as_ptr()).guard != (*block.as_ptr()).compute_guard(seed) {
                self.report(CorruptionCode::CorruptedChunk, block.as_ptr().cast());
                return None;
            }

            return Some(Block::Direct { block });
        }

        self.report(CorruptionCode::InvalidFree, ptr);
        None
    }

    unsafe fn free_block(&mut self, block: Block) {
        match block {
            Block::Chunk { ext, base } => {
                let h = chunk::read(base);
                self.account_tag_free(h.tag, h.size() - HEADER_SIZE);
                self.statistics.account_free();

                self.release_chunk(ext, base, h.size(), h.is_prev_free(), h.tag);
            }
            Block::Direct { block } => self.free_direct(block),
        }
    }

    /// Turn `base..base + size` into free space: coalesce it with its free neighbours,
    /// give it back to the backing store if policy allows, and register what remains.
    unsafe fn release_chunk(
        &mut self,
        ext: NonNull<ExtentHeader>,
        mut base: *mut u8,
        mut size: usize,
        prev_free: bool,
        tag: u32,
    ) {
        let seed = self.seed();

        let next = base.add(size);
        let next_header = chunk::read(next);
        if !next_header.is_allocated() {
            self.deregister_free(next, next_header.size());
            chunk::write_absorbed(seed, next, next_header.tag);
            size += next_header.size();
        }

        if prev_free {
            let prev = chunk::prev_free_base(base);
            let prev_size = chunk::read(prev).size();
            self.deregister_free(prev, prev_size);
            chunk::write_absorbed(seed, base, tag);
            base = prev;
            size += prev_size;
        }

        chunk::write_free(seed, base, size, tag);
        chunk::set_prev_free(base.add(size), true);

        if ExtentHeader::is_spanned_by(ext, base, size) && self.release_extent(ext) {
            return;
        }

        if !self.config.flags.contains(HeapFlags::NO_PARTIAL_FREES) {
            size = self.trim_tail(ext, base, size, tag);
        }

        self.register_free(base, size);
    }

    /// Hand a whole extent back to the backing store. Returns `false` if it refused.
    unsafe fn release_extent(&mut self, ext: NonNull<ExtentHeader>) -> bool {
        let region_base = (*ext.as_ptr()).region_base;
        let region_size = (*ext.as_ptr()).region_size;

        Node::unlink(&mut self.extents, ext.cast());

        if self.backing.contract(NonNull::new_unchecked(region_base), region_size) {
            self.statistics.account_contract(region_size);
            self.statistics.extent_count -= 1;
            log::debug!("heap: released extent at {:p} ({:#x} bytes)", region_base, region_size);
            true
        } else {
            extent::link(&mut self.extents, ext);
            false
        }
    }

    /// Offer the memory above the free chunk `base..base + size` back to the
    /// backing store if it is the last chunk of its extent and is large enough.
    ///
    /// Returns the new size of the chunk.
    unsafe fn trim_tail(&mut self, ext: NonNull<ExtentHeader>, base: *mut u8, size: usize, tag: u32) -> usize {
        let seed = self.seed();
        let chunks_end = (*ext.as_ptr()).chunks_end;

        if base.add(size) != chunks_end || size - MIN_CHUNK_SIZE <= self.config.trim_threshold {
            return size;
        }

        let region_end = (*ext.as_ptr()).region_end();
        let release_mask = self.config.granularity_mask().max(CHUNK_UNIT - 1);
        let release_base = ptr_utils::align_up_by(base.add(MIN_CHUNK_SIZE + FENCEPOST_SIZE), release_mask);

        if release_base as usize >= region_end as usize {
            return size;
        }

        let released = ptr_utils::span_len(release_base, region_end);
        if !self.backing.contract(NonNull::new_unchecked(release_base), released) {
            return size;
        }

        let new_chunks_end = release_base.sub(FENCEPOST_SIZE);
        ExtentHeader::truncate(ext, seed, new_chunks_end, release_base);

        let new_size = ptr_utils::span_len(base, new_chunks_end);
        chunk::write_free(seed, base, new_size, tag);

        self.statistics.account_contract(released);
        log::debug!("heap: trimmed {:#x} bytes off the extent at {:p}", released, ext);

        new_size
    }

    unsafe fn reallocate_inner(&mut self, ptr: *mut u8, new_size: usize, tag: u32) -> Option<NonNull<u8>> {
        let block = self.resolve(ptr)?;

        match block {
            Block::Chunk { ext, base } if !self.is_direct(new_size) => {
                if let Some(ptr) = self.resize_in_place(ext, base, new_size, tag) {
                    return Some(ptr);
                }
            }
            Block::Direct { block } if self.is_direct(new_size) => {
                if self.resize_direct_in_place(block, new_size, tag) {
                    return NonNull::new(ptr);
                }
            }
            _ => {}
        }

        let old_usable = chunk::read(chunk::user_to_base(ptr)).size() - HEADER_SIZE;
        let allocation = self.allocate_accounted(new_size, tag, CHUNK_UNIT - 1)?;

        allocation.as_ptr().copy_from_nonoverlapping(ptr, old_usable.min(new_size));

        // the allocation above only touched free chunks, so `block` still describes `ptr`
        self.free_block(block);

        Some(allocation)
    }

    /// Shrink the chunk at `base`, or grow it into the free chunk above.
    unsafe fn resize_in_place(
        &mut self,
        ext: NonNull<ExtentHeader>,
        base: *mut u8,
        new_size: usize,
        tag: u32,
    ) -> Option<NonNull<u8>> {
        let seed = self.seed();
        let required = chunk::required_chunk_size(new_size)?;
        let h = chunk::read(base);
        let size = h.size();
        let prev_flag = h.flags() & PREV_FREE;

        if required <= size {
            if size - required >= MIN_CHUNK_SIZE {
                chunk::write_allocated(seed, base, required, prev_flag, tag);
                self.release_chunk(ext, base.add(required), size - required, false, h.tag);
            } else {
                chunk::write_allocated(seed, base, size, prev_flag, tag);
            }
        } else {
            let next = base.add(size);
            let next_header = chunk::read(next);

            if next_header.is_allocated() || size + next_header.size() < required {
                return None;
            }

            let total = size + next_header.size();
            self.deregister_free(next, next_header.size());

            if total - required >= MIN_CHUNK_SIZE {
                let rest = base.add(required);
                chunk::write_free(seed, rest, total - required, next_header.tag);
                self.register_free(rest, total - required);
                chunk::write_allocated(seed, base, required, prev_flag, tag);
            } else {
                chunk::set_prev_free(base.add(total), false);
                chunk::write_allocated(seed, base, total, prev_flag, tag);
            }
        }

        self.account_tag_resize(h, tag, chunk::read(base).size());
        Some(chunk::base_to_user(base))
    }

    /// Move the tag statistics of a chunk that was resized in place from its old header.
    fn account_tag_resize(&mut self, old: Header, tag: u32, new_size: usize) {
        self.account_tag_free(old.tag, old.size() - HEADER_SIZE);
        self.account_tag_alloc(tag, new_size - HEADER_SIZE);
    }

    #[inline]
    unsafe fn register_free(&mut self, base: *mut u8, size: usize) {
        self.index.insert(base, size);
        self.statistics.free_list_size += size;
    }

    #[inline]
    unsafe fn deregister_free(&mut self, base: *mut u8, size: usize) {
        self.index.remove(base, size);
        self.statistics.free_list_size -= size;
    }

    fn after_operation(&mut self) {
        if !self.config.flags.contains(HeapFlags::PERIODIC_VALIDATION) {
            return;
        }

        self.operations_since_validation += 1;
        if self.operations_since_validation >= self.config.validation_interval.max(1) {
            self.operations_since_validation = 0;
            self.validate();
        }
    }

    /// Return every extent and direct block to the backing store.
    ///
    /// Outstanding allocations become invalid. Calling this again reports
    /// [`CorruptionCode::DoubleDestroy`]. Dropping a heap that was not destroyed
    /// destroys it.
    pub fn destroy(&mut self) {
        if !self.is_live() {
            self.report(CorruptionCode::DoubleDestroy, (self as *const Self).cast());
            return;
        }

        self.release_all();
    }

    fn release_all(&mut self) {
        unsafe {
            while let Some(node) = self.directs {
                let block = node.cast::<DirectHeader>();
                let (region_base, region_size) = ((*block.as_ptr()).region_base, (*block.as_ptr()).region_size);

                Node::unlink(&mut self.directs, node);
                self.contract_on_destroy(region_base, region_size);
            }

            while let Some(node) = self.extents {
                let ext = ExtentHeader::from_node(node);
                let (region_base, region_size) = ((*ext.as_ptr()).region_base, (*ext.as_ptr()).region_size);

                Node::unlink(&mut self.extents, node);
                self.contract_on_destroy(region_base, region_size);
            }
        }

        self.index.clear();
        self.tags.clear();
        self.statistics.free_list_size = 0;
        self.statistics.extent_count = 0;
        self.magic = 0;
    }

    unsafe fn contract_on_destroy(&mut self, base: *mut u8, size: usize) {
        if self.backing.contract(NonNull::new_unchecked(base), size) {
            self.statistics.account_contract(size);
        } else {
            log::warn!("heap: backing store refused to take back {:#x} bytes at {:p}", size, base);
        }
    }
}

impl<B: Backing> Drop for Heap<B> {
    fn drop(&mut self) {
        if self.is_live() {
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests;
