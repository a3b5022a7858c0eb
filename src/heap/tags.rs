//! Per-tag statistics, kept while [`HeapFlags::COLLECT_TAG_STATISTICS`] is set.
//!
//! Entries are allocated from the heap itself through the general path,
//! bypassing the allocation counters and the tag accounting. The space taken
//! by the entries is accounted under [`STATISTICS_TAG`].

use core::{fmt, mem::size_of, ptr::NonNull};

use super::Heap;
use crate::{node::Node, Backing, HeapFlags, CHUNK_UNIT};

/// The tag under which the heap accounts its own statistics entries.
pub const STATISTICS_TAG: u32 = u32::from_le_bytes(*b"MmSt");

/// Statistics about the allocations made with one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagStatistics {
    /// The tag these statistics are for.
    pub tag: u32,
    /// The largest single allocation ever made with this tag.
    pub largest_allocation: usize,
    /// Bytes currently allocated with this tag.
    pub active_size: usize,
    /// The largest `active_size` has been.
    pub largest_active_size: usize,
    /// Bytes ever allocated with this tag.
    pub lifetime_allocation_size: u64,
    /// Number of live allocations with this tag.
    pub active_allocation_count: usize,
    /// The largest `active_allocation_count` has been.
    pub largest_active_allocation_count: usize,
}

impl TagStatistics {
    pub(crate) const fn new(tag: u32) -> Self {
        Self {
            tag,
            largest_allocation: 0,
            active_size: 0,
            largest_active_size: 0,
            lifetime_allocation_size: 0,
            active_allocation_count: 0,
            largest_active_allocation_count: 0,
        }
    }

    fn account_alloc(&mut self, size: usize) {
        self.largest_allocation = self.largest_allocation.max(size);
        self.active_size += size;
        self.largest_active_size = self.largest_active_size.max(self.active_size);
        self.lifetime_allocation_size += size as u64;
        self.active_allocation_count += 1;
        self.largest_active_allocation_count =
            self.largest_active_allocation_count.max(self.active_allocation_count);
    }

    fn account_free(&mut self, size: usize) {
        self.active_size = self.active_size.saturating_sub(size);
        self.active_allocation_count = self.active_allocation_count.saturating_sub(1);
    }
}

/// Shows a tag as its four characters if they are printable, otherwise in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagName(pub u32);

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();

        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

pub(crate) const TAG_TABLE_HEADER: &str =
    "Tag        | Largest Alloc | Active Bytes (Max)        | Lifetime Bytes | Active Count (Max)";

impl fmt::Display for TagStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<10} | {:>13} | {:>11} ({:>11}) | {:>14} | {:>8} ({:>8})",
            TagName(self.tag),
            self.largest_allocation,
            self.active_size,
            self.largest_active_size,
            self.lifetime_allocation_size,
            self.active_allocation_count,
            self.largest_active_allocation_count,
        )
    }
}

#[repr(C)] // ensure the node ptr is the same as the entry ptr
struct TagEntry {
    node: Node,
    stats: TagStatistics,
}

const ENTRY_SIZE: usize = size_of::<TagEntry>();
const _: () = assert!(core::mem::align_of::<TagEntry>() <= CHUNK_UNIT);

/// Tag-sorted list of entries, plus the heap's own entry.
#[derive(Debug)]
pub(crate) struct TagTable {
    entries: Option<NonNull<Node>>,
    internal: TagStatistics,
}

impl TagTable {
    pub const fn new() -> Self {
        Self { entries: None, internal: TagStatistics::new(STATISTICS_TAG) }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// The entry for `tag`, or the entry after which one for `tag` should be linked.
    unsafe fn find(&self, tag: u32) -> Result<NonNull<TagEntry>, Option<NonNull<Node>>> {
        let mut after = None;

        for node in Node::iter(self.entries) {
            let entry = node.cast::<TagEntry>();
            let entry_tag = (*entry.as_ptr()).stats.tag;

            if entry_tag == tag {
                return Ok(entry);
            } else if entry_tag > tag {
                break;
            }
            after = Some(node);
        }

        Err(after)
    }
}

impl<B: Backing> Heap<B> {
    #[inline]
    pub(crate) fn collects_tag_statistics(&self) -> bool {
        self.config.flags.contains(HeapFlags::COLLECT_TAG_STATISTICS)
    }

    /// Iterates over the statistics of every tag seen so far, the heap's own
    /// [`STATISTICS_TAG`] entry first and then in ascending tag order.
    ///
    /// Empty unless [`HeapFlags::COLLECT_TAG_STATISTICS`] is set.
    pub fn tag_statistics(&self) -> impl Iterator<Item = &TagStatistics> + '_ {
        let collecting = self.collects_tag_statistics();
        let internal = core::iter::once(&self.tags.internal).filter(move |_| collecting);

        // SAFETY: entries stay linked and untouched while `self` is borrowed
        let entries = unsafe { Node::iter(self.tags.entries) };
        internal.chain(entries.map(|node| unsafe { &(*node.cast::<TagEntry>().as_ptr()).stats }))
    }

    /// The statistics for `tag`, if any allocation was made with it.
    pub fn statistics_for_tag(&self, tag: u32) -> Option<&TagStatistics> {
        self.tag_statistics().find(|stats| stats.tag == tag)
    }

    pub(crate) fn account_tag_alloc(&mut self, tag: u32, size: usize) {
        if !self.collects_tag_statistics() {
            return;
        }

        if tag == STATISTICS_TAG {
            self.tags.internal.account_alloc(size);
            return;
        }

        unsafe {
            let after = match self.tags.find(tag) {
                Ok(entry) => return (*entry.as_ptr()).stats.account_alloc(size),
                Err(after) => after,
            };

            // on failure the allocation simply goes unrecorded
            let Some(ptr) = self.allocate_chunk(ENTRY_SIZE, STATISTICS_TAG, CHUNK_UNIT - 1) else {
                return;
            };
            self.tags.internal.account_alloc(self.chunk_usable_size(ptr));

            let entry = ptr.cast::<TagEntry>();
            core::ptr::addr_of_mut!((*entry.as_ptr()).stats).write(TagStatistics::new(tag));
            (*entry.as_ptr()).stats.account_alloc(size);

            // the allocation above cannot have linked an entry, so `after` is still valid
            Node::link_after(&mut self.tags.entries, after, entry.cast());
        }
    }

    pub(crate) fn account_tag_free(&mut self, tag: u32, size: usize) {
        if !self.collects_tag_statistics() {
            return;
        }

        if tag == STATISTICS_TAG {
            self.tags.internal.account_free(size);
        } else if let Ok(entry) = unsafe { self.tags.find(tag) } {
            unsafe { (*entry.as_ptr()).stats.account_free(size) };
        }
    }
}
