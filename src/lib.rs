//! A tagged, self-validating heap allocator over a pluggable backing store.
//!
//! For getting started:
//! - Pick or implement a [`Backing`]: [`AllocatorBacking`] draws on another allocator,
//!     [`RegionBacking`] hands out a fixed region of memory.
//! - Create a [`Heap`] with `Heap::new(backing, config)`, see [`HeapConfig`].
//! - Wrap it in a [`HeapLock`](sync::HeapLock) to share it or to use it as a global allocator.
//!
//! Every allocation carries a 32-bit tag, used for per-tag statistics
//! (see [`HeapFlags::COLLECT_TAG_STATISTICS`]) and diagnostics.
//! Chunk metadata is protected by guard values derived from [`HeapConfig::heap_seed`],
//! damage is reported through [`Backing::on_corruption`], both when freeing and
//! when running [`Heap::validate`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]

#[cfg(test)]
mod test_utils;
pub(crate) mod ptr_utils;

pub(crate) mod node;

mod config;
mod error;
mod heap;

pub mod backing;
#[cfg(feature = "lock_api")]
pub mod sync;

pub use backing::{AllocatorBacking, Backing, NoBacking, RegionBacking};
pub use config::{HeapConfig, HeapFlags, DEFAULT_TRIM_THRESHOLD};
pub use error::{CorruptionCode, HeapError};
pub use heap::{Heap, Statistics, TagName, TagStatistics, STATISTICS_TAG};

/// The granularity of chunk sizes and the minimum alignment of every allocation.
///
/// Each chunk spends one unit on its header.
pub const CHUNK_UNIT: usize = 16;
