//! Heap statistics.

use super::Heap;
use crate::Backing;

/// Running counters of a [`Heap`].
///
/// # Example
///
/// ```
/// # use tagheap::{AllocatorBacking, Heap, HeapConfig};
/// # use allocator_api2::alloc::Global;
/// let mut heap = Heap::new(AllocatorBacking::new(Global), HeapConfig::new());
/// let ptr = heap.allocate(24, 0).unwrap();
/// assert_eq!(heap.statistics().allocations, 1);
/// unsafe { heap.free(ptr.as_ptr()) };
/// assert_eq!(heap.statistics().total_free_calls, 1);
/// eprintln!("{}", heap.statistics());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Statistics {
    /// Number of outstanding allocations carved from extents.
    pub allocations: usize,
    /// Number of outstanding direct allocations.
    pub direct_allocations: usize,
    /// Sum of the requested sizes of outstanding direct allocations.
    pub direct_allocation_size: usize,

    /// Number of successful allocations, direct or not. Reallocations that move count too.
    pub total_allocation_calls: u64,
    /// Number of frees that released an allocation.
    pub total_free_calls: u64,
    /// Number of allocations that could not be satisfied.
    pub failed_allocations: u64,

    /// Bytes currently held from the backing store.
    pub total_heap_size: usize,
    /// The largest `total_heap_size` has been.
    pub max_heap_size: usize,
    /// Bytes in free chunks, metadata included.
    pub free_list_size: usize,
    /// Number of extents currently held.
    pub extent_count: usize,
}

impl Statistics {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            allocations: 0,
            direct_allocations: 0,
            direct_allocation_size: 0,
            total_allocation_calls: 0,
            total_free_calls: 0,
            failed_allocations: 0,
            total_heap_size: 0,
            max_heap_size: 0,
            free_list_size: 0,
            extent_count: 0,
        }
    }

    /// Number of outstanding allocations of any kind.
    #[inline]
    pub const fn outstanding(&self) -> usize {
        self.allocations + self.direct_allocations
    }

    #[inline]
    pub(crate) fn account_alloc(&mut self) {
        self.allocations += 1;
        self.total_allocation_calls += 1;
    }

    #[inline]
    pub(crate) fn account_free(&mut self) {
        self.allocations -= 1;
        self.total_free_calls += 1;
    }

    #[inline]
    pub(crate) fn account_direct_alloc(&mut self, size: usize) {
        self.direct_allocations += 1;
        self.direct_allocation_size += size;
        self.total_allocation_calls += 1;
    }

    #[inline]
    pub(crate) fn account_direct_free(&mut self, size: usize) {
        self.direct_allocations -= 1;
        self.direct_allocation_size -= size;
        self.total_free_calls += 1;
    }

    #[inline]
    pub(crate) fn account_failure(&mut self) {
        self.failed_allocations += 1;
    }

    #[inline]
    pub(crate) fn account_expand(&mut self, size: usize) {
        self.total_heap_size += size;
        self.max_heap_size = self.max_heap_size.max(self.total_heap_size);
    }

    #[inline]
    pub(crate) fn account_contract(&mut self, size: usize) {
        self.total_heap_size -= size;
    }
}

impl core::fmt::Display for Statistics {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"Stat                   | Current             | Accumulative
-----------------------|---------------------|--------------------
# of Allocations       | {:>19} | {:>19}
# of Direct Allocs     | {:>19} |                 N/A
# of Direct Bytes      | {:>19} |                 N/A
# of Frees             |                 N/A | {:>19}
# of Failed Allocs     |                 N/A | {:>19}
# of Heap Bytes        | {:>19} | {:>19}
# of Free List Bytes   | {:>19} |                 N/A
# of Extents           | {:>19} |                 N/A"#,
            self.allocations,
            self.total_allocation_calls,
            self.direct_allocations,
            self.direct_allocation_size,
            self.total_free_calls,
            self.failed_allocations,
            self.total_heap_size,
            self.max_heap_size,
            self.free_list_size,
            self.extent_count,
        )
    }
}

impl<B: Backing> Heap<B> {
    /// Obtain a reference to the heap's statistics.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Writes the statistics, and the per-tag statistics if they are being collected,
    /// to the `log` facade at `info` level.
    pub fn log_statistics(&self) {
        log::info!("heap statistics:\n{}", self.statistics);

        if self.collects_tag_statistics() {
            log::info!("{}", super::tags::TAG_TABLE_HEADER);
            for stats in self.tag_statistics() {
                log::info!("{}", stats);
            }
        }
    }
}
