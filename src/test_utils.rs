//! Test fixtures.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::{Backing, CorruptionCode, CHUNK_UNIT};

/// A backing over the system allocator that records what the heap asks of it.
///
/// Only whole regions are taken back, partial contractions are refused.
#[derive(Debug, Default)]
pub(crate) struct RecordingBacking {
    live: Vec<(usize, usize)>,
    expansions: Vec<(usize, usize)>,
    contractions: Vec<(usize, usize)>,
    contract_calls: usize,
    corruptions: Vec<(CorruptionCode, usize)>,
    fail_expansions: bool,
    refuse_contractions: bool,
}

impl RecordingBacking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(base, size)` handed out, in order.
    pub fn expansions(&self) -> &[(usize, usize)] {
        &self.expansions
    }

    /// Every `(base, size)` taken back, in order.
    pub fn contractions(&self) -> &[(usize, usize)] {
        &self.contractions
    }

    /// How many times `contract` was called, whether or not it took the memory back.
    pub fn contract_calls(&self) -> usize {
        self.contract_calls
    }

    /// Every `(code, location)` reported.
    pub fn corruptions(&self) -> &[(CorruptionCode, usize)] {
        &self.corruptions
    }

    pub fn clear_corruptions(&mut self) {
        self.corruptions.clear();
    }

    /// Sum of the sizes of the regions currently handed out.
    pub fn held_bytes(&self) -> usize {
        self.live.iter().map(|&(_, size)| size).sum()
    }

    pub fn fail_expansions(&mut self, fail: bool) {
        self.fail_expansions = fail;
    }

    pub fn refuse_contractions(&mut self, refuse: bool) {
        self.refuse_contractions = refuse;
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, CHUNK_UNIT).unwrap()
    }
}

unsafe impl Backing for RecordingBacking {
    fn expand(&mut self, size: usize, _tag: u32) -> Option<NonNull<[u8]>> {
        if self.fail_expansions || size == 0 || size > isize::MAX as usize / 2 {
            return None;
        }

        let base = NonNull::new(unsafe { alloc(Self::layout(size)) })?;
        self.live.push((base.as_ptr() as usize, size));
        self.expansions.push((base.as_ptr() as usize, size));

        Some(NonNull::slice_from_raw_parts(base, size))
    }

    unsafe fn contract(&mut self, base: NonNull<u8>, size: usize) -> bool {
        self.contract_calls += 1;
        if self.refuse_contractions {
            return false;
        }

        let region = (base.as_ptr() as usize, size);
        let Some(index) = self.live.iter().position(|&live| live == region) else {
            return false;
        };

        self.live.swap_remove(index);
        self.contractions.push(region);
        dealloc(base.as_ptr(), Self::layout(size));

        true
    }

    fn on_corruption(&mut self, code: CorruptionCode, location: *const u8) {
        self.corruptions.push((code, location as usize));
    }
}

impl Drop for RecordingBacking {
    fn drop(&mut self) {
        for &(base, size) in &self.live {
            unsafe { dealloc(base as *mut u8, Self::layout(size)) };
        }
    }
}
