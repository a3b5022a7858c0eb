//! The validator walks every extent, chunk, free list and direct block,
//! reporting every inconsistency it finds without stopping at the first.

use core::ptr::NonNull;

use super::{
    bins::{self, FreeIndex, BIN_COUNT},
    chunk::{self, MIN_CHUNK_SIZE},
    direct::DirectHeader,
    extent::{self, ExtentHeader},
    Heap, Statistics, HEAP_MAGIC,
};
use crate::{node::Node, ptr_utils, Backing, CorruptionCode, CHUNK_UNIT};

/// Counts reports as they're passed on.
struct Reporter<'r> {
    report: &'r mut dyn FnMut(CorruptionCode, *const u8),
    count: usize,
}

impl Reporter<'_> {
    fn report(&mut self, code: CorruptionCode, location: *const u8) {
        self.count += 1;
        (self.report)(code, location);
    }
}

/// Borrows the heap's bookkeeping, leaving the backing free to receive reports.
struct Checker<'h> {
    seed: u32,
    magic: u32,
    heap_addr: *const u8,
    index: &'h FreeIndex,
    extents: Option<NonNull<Node>>,
    directs: Option<NonNull<Node>>,
    statistics: &'h Statistics,
}

impl<B: Backing> Heap<B> {
    /// Check the heap's integrity, reporting each problem found through
    /// [`Backing::on_corruption`].
    ///
    /// Returns whether the heap is free of detectable corruption.
    pub fn validate(&mut self) -> bool {
        let heap_addr = (self as *const Self).cast();
        let Heap { backing, config, magic, index, extents, directs, statistics, .. } = self;
        let checker = Checker::new(heap_addr, config.heap_seed, *magic, index, *extents, *directs, statistics);

        checker.run(&mut |code, location| backing.on_corruption(code, location))
    }

    /// Like [`Heap::validate`], but every problem found is passed to `report`
    /// instead of the backing.
    pub fn validate_with(&self, mut report: impl FnMut(CorruptionCode, *const u8)) -> bool {
        let checker = Checker::new(
            (self as *const Self).cast(),
            self.seed(),
            self.magic,
            &self.index,
            self.extents,
            self.directs,
            &self.statistics,
        );

        checker.run(&mut report)
    }
}

impl<'h> Checker<'h> {
    fn new(
        heap_addr: *const u8,
        seed: u32,
        magic: u32,
        index: &'h FreeIndex,
        extents: Option<NonNull<Node>>,
        directs: Option<NonNull<Node>>,
        statistics: &'h Statistics,
    ) -> Self {
        Self { seed, magic, heap_addr, index, extents, directs, statistics }
    }

    fn run(&self, report: &mut dyn FnMut(CorruptionCode, *const u8)) -> bool {
        let mut reporter = Reporter { report, count: 0 };

        if self.magic != HEAP_MAGIC {
            reporter.report(CorruptionCode::CorruptStructures, self.heap_addr);
            return false;
        }

        unsafe {
            self.check_extents(&mut reporter);
            self.check_index(&mut reporter);
            self.check_directs(&mut reporter);
        }

        reporter.count == 0
    }

    /// An upper bound on the length of any list in a healthy heap.
    fn list_limit(&self) -> usize {
        self.statistics.total_heap_size / MIN_CHUNK_SIZE + 1
    }

    #[inline]
    unsafe fn extent_ok(&self, ext: NonNull<ExtentHeader>) -> bool {
        let header = &*ext.as_ptr();
        let base = ext.as_ptr() as usize;

        header.guard == header.compute_guard(self.seed)
            && ptr_utils::is_aligned_to(ext.as_ptr().cast(), CHUNK_UNIT)
            && base >= header.region_base as usize
            && ExtentHeader::first_chunk(ext) as usize + MIN_CHUNK_SIZE <= header.chunks_end as usize
            && ptr_utils::is_aligned_to(header.chunks_end, CHUNK_UNIT)
            && header.chunks_end as usize + extent::FENCEPOST_SIZE <= header.region_end() as usize
    }

    unsafe fn check_extents(&self, reporter: &mut Reporter) {
        let mut prev_end = 0;
        let mut count = 0;

        for node in Node::iter(self.extents) {
            let ext = ExtentHeader::from_node(node);

            count += 1;
            if count > self.statistics.extent_count {
                reporter.report(CorruptionCode::BadExtent, ext.as_ptr().cast());
                return;
            }

            if !self.extent_ok(ext) {
                reporter.report(CorruptionCode::BadExtent, ext.as_ptr().cast());
                continue;
            }

            let header = &*ext.as_ptr();
            if (header.region_base as usize) < prev_end {
                reporter.report(CorruptionCode::BadExtent, ext.as_ptr().cast());
            }
            prev_end = header.region_end() as usize;

            self.walk_chunks(ext, reporter);
        }

        if count != self.statistics.extent_count {
            reporter.report(CorruptionCode::CorruptStructures, self.heap_addr);
        }
    }

    /// Walk the chunks of a sound extent from its first chunk to its fencepost.
    unsafe fn walk_chunks(&self, ext: NonNull<ExtentHeader>, reporter: &mut Reporter) {
        let end = (*ext.as_ptr()).chunks_end;
        let mut at = ExtentHeader::first_chunk(ext);
        let mut prev_free = false;

        while at < end {
            let h = chunk::read(at);
            let size = h.size();

            if size < MIN_CHUNK_SIZE || size > ptr_utils::span_len(at, end) || h.is_fencepost() || h.is_direct() {
                // the rest of the extent can't be walked
                reporter.report(CorruptionCode::CorruptedChunk, at);
                return;
            }

            let sound = h.guard == chunk::guard(self.seed, at, h.size_and_flags)
                && h.is_prev_free() == prev_free
                && (h.is_allocated() || chunk::footer_ok(at, &h));

            if !sound {
                reporter.report(CorruptionCode::CorruptedChunk, at);
            } else if !h.is_allocated() {
                if prev_free {
                    // should have been coalesced
                    reporter.report(CorruptionCode::FreeSpaceInconsistency, at);
                }
                if !self.is_indexed(at, size) {
                    reporter.report(CorruptionCode::FreeSpaceInconsistency, at);
                }
            }

            prev_free = !h.is_allocated();
            at = at.add(size);
        }

        let fencepost = chunk::read(end);
        if !fencepost.is_fencepost()
            || !fencepost.is_allocated()
            || fencepost.is_prev_free() != prev_free
            || !chunk::guard_ok(self.seed, end)
        {
            reporter.report(CorruptionCode::BadExtent, end);
        }
    }

    unsafe fn is_indexed(&self, base: *mut u8, size: usize) -> bool {
        let target = chunk::node(base);

        Node::iter(self.index.list(bins::bin_of(size)))
            .take(self.list_limit())
            .any(|node| node == target)
    }

    unsafe fn check_index(&self, reporter: &mut Reporter) {
        let limit = self.list_limit();
        let mut trust_total = true;
        let mut total = 0;

        for bin in 0..BIN_COUNT {
            let head = self.index.list(bin);
            let available = self.index.avails() & (1 << bin) != 0;

            if available != head.is_some() {
                reporter.report(CorruptionCode::FreeSpaceInconsistency, self.heap_addr);
                trust_total = false;
            }

            let mut prev = None;
            let mut length = 0;
            let mut cursor = head;

            while let Some(node) = cursor {
                length += 1;
                let base = chunk::node_to_base(node);

                let owner = extent::find(self.extents, base).filter(|&ext| self.extent_ok(ext));
                if length > limit || owner.is_none() {
                    // looping, or pointing outside the heap: the rest of the list is unusable
                    reporter.report(CorruptionCode::FreeSpaceInconsistency, base);
                    trust_total = false;
                    break;
                }

                let h = chunk::read(base);
                let misfiled = h.size() < MIN_CHUNK_SIZE || bins::bin_of(h.size()) != bin;

                if (*node.as_ptr()).prev != prev || h.is_allocated() || misfiled {
                    reporter.report(CorruptionCode::FreeSpaceInconsistency, base);
                    trust_total = false;
                } else {
                    total += h.size();
                }

                prev = Some(node);
                cursor = (*node.as_ptr()).next;
            }
        }

        if trust_total && total != self.statistics.free_list_size {
            reporter.report(CorruptionCode::CorruptStructures, self.heap_addr);
        }
    }

    unsafe fn check_directs(&self, reporter: &mut Reporter) {
        let mut trust_total = true;
        let mut total = 0;
        let mut count = 0;

        for node in Node::iter(self.directs).take(self.list_limit()) {
            let block = node.cast::<DirectHeader>();
            let header = &*block.as_ptr();

            if header.guard != header.compute_guard(self.seed) {
                reporter.report(CorruptionCode::BadExtent, block.as_ptr().cast());
                trust_total = false;
                continue;
            }

            let base = DirectHeader::chunk_base(block);
            let h = chunk::read(base);
            let sound = h.guard == chunk::guard(self.seed, base, h.size_and_flags)
                && h.is_direct()
                && h.size() <= ptr_utils::span_len(base, header.region_end());

            if !sound {
                reporter.report(CorruptionCode::CorruptedChunk, base);
            }
            if h.is_allocated() {
                total += header.size;
                count += 1;
            }
        }

        if trust_total
            && (total != self.statistics.direct_allocation_size || count != self.statistics.direct_allocations)
        {
            reporter.report(CorruptionCode::CorruptStructures, self.heap_addr);
        }
    }
}
