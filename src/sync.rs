//! [`HeapLock`] facilitates using [`Heap`] as a Rust global allocator,
//! or other usage across multiple threads.
//!
//! See [`HeapLock`].

use core::ptr::{null_mut, NonNull};

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use crate::{Backing, Heap, CHUNK_UNIT};

const RELEASE_LOCK_ON_REALLOC_LIMIT: usize = 0x4000;

/// Wraps a mutex-locked [`Heap`].
///
/// Allocations made through [`GlobalAlloc`] and [`Allocator`] are all tagged with
/// the tag given to [`HeapLock::new`].
///
/// # Example
/// ```rust
/// use tagheap::{sync::HeapLock, AllocatorBacking, Heap, HeapConfig};
/// use allocator_api2::{alloc::Global, vec::Vec};
///
/// let heap = Heap::new(AllocatorBacking::new(Global), HeapConfig::new());
/// let lock = HeapLock::<spin::Mutex<()>, _>::new(heap, u32::from_le_bytes(*b"Vecs"));
///
/// let mut vec = Vec::new_in(&lock);
/// vec.extend(0..1000u32);
/// assert_eq!(lock.lock().statistics().allocations, 1);
/// ```
#[derive(Debug)]
pub struct HeapLock<R: lock_api::RawMutex, B: Backing> {
    mutex: lock_api::Mutex<R, Heap<B>>,
    tag: u32,
}

impl<R: lock_api::RawMutex, B: Backing> HeapLock<R, B> {
    /// Create a new [`HeapLock`], tagging its allocations with `tag`.
    pub const fn new(heap: Heap<B>, tag: u32) -> Self {
        Self { mutex: lock_api::Mutex::new(heap), tag }
    }

    /// The tag given to allocations made through the allocator traits.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Lock the mutex and access the inner [`Heap`].
    #[track_caller]
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Heap<B>> {
        self.mutex.lock()
    }

    /// Try to lock the mutex and access the inner [`Heap`].
    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<'_, R, Heap<B>>> {
        self.mutex.try_lock()
    }

    /// Returns a mutable reference to the inner [`Heap`].
    ///
    /// This avoids locking, as having a mutable reference statically
    /// guarantees that `self` is not locked.
    pub fn get_mut(&mut self) -> &mut Heap<B> {
        self.mutex.get_mut()
    }

    /// Retrieve the inner [`Heap`].
    pub fn into_inner(self) -> Heap<B> {
        self.mutex.into_inner()
    }
}

/// Allocate for `layout`, using the plain path where the alignment allows.
#[inline]
fn allocate<B: Backing>(heap: &mut Heap<B>, layout: Layout, tag: u32) -> Option<NonNull<u8>> {
    if layout.align() <= CHUNK_UNIT {
        heap.allocate(layout.size(), tag)
    } else {
        heap.aligned_allocate(layout.align(), layout.size(), tag).ok()
    }
}

#[inline(always)]
fn is_aligned_to(ptr: *mut u8, align: usize) -> bool {
    (ptr as usize).trailing_zeros() >= align.trailing_zeros()
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    NonNull::slice_from_raw_parts(nn, len)
}

impl<R: lock_api::RawMutex, B: Backing> HeapLock<R, B> {
    /// Move the allocation at `ptr` to a fresh one fitting `new_layout`, copying `copy_count` bytes.
    ///
    /// The lock is released while copying large allocations.
    unsafe fn move_allocation(
        &self,
        ptr: *mut u8,
        new_layout: Layout,
        copy_count: usize,
    ) -> Option<NonNull<u8>> {
        let mut lock = self.lock();
        let allocation = allocate(&mut lock, new_layout, self.tag)?;

        if copy_count > RELEASE_LOCK_ON_REALLOC_LIMIT {
            drop(lock);
            allocation.as_ptr().copy_from_nonoverlapping(ptr, copy_count);
            lock = self.lock();
        } else {
            allocation.as_ptr().copy_from_nonoverlapping(ptr, copy_count);
        }

        lock.free(ptr);

        Some(allocation)
    }
}

unsafe impl<R: lock_api::RawMutex, B: Backing> GlobalAlloc for HeapLock<R, B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate(&mut self.lock(), layout, self.tag).map_or(null_mut(), |nn| nn.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.lock().free(ptr)
    }

    #[track_caller]
    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if old_layout.align() <= CHUNK_UNIT {
            // a failed reallocation leaves the original untouched
            return self.lock().reallocate(ptr, new_size, self.tag).map_or(null_mut(), |nn| nn.as_ptr());
        }

        if let Some(nn) = NonNull::new(ptr) {
            if new_size <= self.lock().usable_size(nn) {
                return ptr;
            }
        }

        // SAFETY: guaranteed by caller that `new_size` is a valid layout size
        let new_layout = Layout::from_size_align_unchecked(new_size, old_layout.align());

        self.move_allocation(ptr, new_layout, old_layout.size().min(new_size))
            .map_or(null_mut(), |nn| nn.as_ptr())
    }
}

unsafe impl<R: lock_api::RawMutex, B: Backing> Allocator for HeapLock<R, B> {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        allocate(&mut self.lock(), layout, self.tag)
            .map(|nn| nonnull_slice_from_raw_parts(nn, layout.size()))
            .ok_or(AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.lock().free(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        if new_layout.align() <= CHUNK_UNIT {
            return self
                .lock()
                .reallocate(ptr.as_ptr(), new_layout.size(), self.tag)
                .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
                .ok_or(AllocError);
        }

        if is_aligned_to(ptr.as_ptr(), new_layout.align())
            && new_layout.size() <= self.lock().usable_size(ptr)
        {
            return Ok(nonnull_slice_from_raw_parts(ptr, new_layout.size()));
        }

        self.move_allocation(ptr.as_ptr(), new_layout, old_layout.size())
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let res = self.grow(ptr, old_layout, new_layout);

        if let Ok(allocation) = res {
            allocation
                .as_ptr()
                .cast::<u8>()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }

        res
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                self.lock().free(ptr.as_ptr());
            }

            return Ok(nonnull_slice_from_raw_parts(NonNull::dangling(), 0));
        }

        if !is_aligned_to(ptr.as_ptr(), new_layout.align()) {
            return self
                .move_allocation(ptr.as_ptr(), new_layout, new_layout.size())
                .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
                .ok_or(AllocError);
        }

        if new_layout.align() > CHUNK_UNIT {
            // reallocating may move the block out of the direct path, losing the alignment
            return Ok(nonnull_slice_from_raw_parts(ptr, new_layout.size()));
        }

        match self.lock().reallocate(ptr.as_ptr(), new_layout.size(), self.tag) {
            Some(nn) => Ok(nonnull_slice_from_raw_parts(nn, new_layout.size())),
            None => Err(AllocError),
        }
    }
}
