//! Heap configuration.

bitflags::bitflags! {
    /// Behavioural switches for a [`Heap`](crate::Heap).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeapFlags: u32 {
        /// Keep per-tag statistics, see [`Heap::tag_statistics`](crate::Heap::tag_statistics).
        const COLLECT_TAG_STATISTICS = 1 << 0;
        /// Run the validator automatically every `validation_interval` operations.
        const PERIODIC_VALIDATION = 1 << 1;
        /// Never hand back less than a whole extent to the backing store.
        const NO_PARTIAL_FREES = 1 << 2;
    }
}

/// Freed space at the end of an extent beyond this many bytes is offered back
/// to the backing store, unless [`HeapFlags::NO_PARTIAL_FREES`] is set.
pub const DEFAULT_TRIM_THRESHOLD: usize = 2 << 20;

/// Configuration for a [`Heap`](crate::Heap).
///
/// # Example
/// ```
/// # use tagheap::{HeapConfig, HeapFlags};
/// let config = HeapConfig::new()
///     .with_expansion_granularity(0x1000)
///     .with_direct_allocation_threshold(0x1700)
///     .with_flags(HeapFlags::PERIODIC_VALIDATION);
/// assert_eq!(config.direct_allocation_threshold, 0x1700);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapConfig {
    /// Every expansion request is rounded up to a multiple of this.
    /// Must be a power of two, zero is treated as one.
    pub expansion_granularity: usize,
    /// The smallest size the heap asks the backing store for when it needs a new extent.
    pub minimum_extent_size: usize,
    /// Seeds the guard values, distinguishing the corruption signatures of different heaps.
    pub heap_seed: u32,
    /// Behavioural switches.
    pub flags: HeapFlags,
    /// Requests of at least this size get their own region from the backing store.
    /// Zero disables the direct path.
    pub direct_allocation_threshold: usize,
    /// See [`DEFAULT_TRIM_THRESHOLD`].
    pub trim_threshold: usize,
    /// With [`HeapFlags::PERIODIC_VALIDATION`], validate after this many operations.
    pub validation_interval: u32,
}

impl HeapConfig {
    /// The default configuration.
    pub const fn new() -> Self {
        Self {
            expansion_granularity: 0x1000,
            minimum_extent_size: 0x10000,
            heap_seed: 0,
            flags: HeapFlags::empty(),
            direct_allocation_threshold: 0,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            validation_interval: 1,
        }
    }

    /// Sets [`Self::expansion_granularity`].
    pub const fn with_expansion_granularity(mut self, granularity: usize) -> Self {
        self.expansion_granularity = granularity;
        self
    }

    /// Sets [`Self::minimum_extent_size`].
    pub const fn with_minimum_extent_size(mut self, size: usize) -> Self {
        self.minimum_extent_size = size;
        self
    }

    /// Sets [`Self::heap_seed`].
    pub const fn with_heap_seed(mut self, seed: u32) -> Self {
        self.heap_seed = seed;
        self
    }

    /// Sets [`Self::flags`].
    pub const fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets [`Self::direct_allocation_threshold`].
    pub const fn with_direct_allocation_threshold(mut self, threshold: usize) -> Self {
        self.direct_allocation_threshold = threshold;
        self
    }

    /// Sets [`Self::trim_threshold`].
    pub const fn with_trim_threshold(mut self, threshold: usize) -> Self {
        self.trim_threshold = threshold;
        self
    }

    /// Sets [`Self::validation_interval`].
    pub const fn with_validation_interval(mut self, interval: u32) -> Self {
        self.validation_interval = interval;
        self
    }

    /// The granularity as an alignment mask.
    pub(crate) const fn granularity_mask(&self) -> usize {
        if self.expansion_granularity <= 1 {
            0
        } else {
            self.expansion_granularity.next_power_of_two() - 1
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
