use core::ptr::{null_mut, NonNull};

use crate::test_utils::RecordingBacking;
use crate::*;

use super::{chunk, extent};

fn heap(config: HeapConfig) -> Heap<RecordingBacking> {
    Heap::new(RecordingBacking::new(), config)
}

unsafe fn filled_with(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    core::slice::from_raw_parts(ptr.as_ptr(), len).iter().all(|&b| b == byte)
}

#[test]
fn freed_chunk_is_reused() {
    let mut heap = heap(HeapConfig::new().with_direct_allocation_threshold(0x1700));

    let first = heap.allocate(0x10, 0).unwrap();
    let _second = heap.allocate(0x10, 0).unwrap();
    unsafe { heap.free(first.as_ptr()) };

    let third = heap.allocate(0x20, 0).unwrap();
    assert_eq!(third, first);
    assert_eq!(heap.backing.expansions().len(), 1);
    assert!(heap.validate());
}

#[test]
fn alignment_guarantee() {
    let mut heap = heap(HeapConfig::new());
    let mut live = Vec::new();

    for shift in 0..=12 {
        let align = 1usize << shift;

        for size in [1, 0x30, 0x1000] {
            let ptr = heap.aligned_allocate(align, size, shift).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align.max(CHUNK_UNIT), 0);
            unsafe { ptr.as_ptr().write_bytes(shift as u8, size) };
            live.push((ptr, size, shift as u8));
        }
    }

    assert!(heap.validate());

    for (ptr, size, byte) in live {
        unsafe {
            assert!(filled_with(ptr, size, byte));
            heap.free(ptr.as_ptr());
        }
    }

    assert!(heap.validate());
    assert!(heap.backing.corruptions().is_empty());
    assert_eq!(heap.statistics().outstanding(), 0);
}

#[test]
fn invalid_alignment() {
    let mut heap = heap(HeapConfig::new());

    for alignment in [0, 3, 24, 0x1001] {
        assert_eq!(heap.aligned_allocate(alignment, 8, 0), Err(HeapError::InvalidAlignment { alignment }));
    }
    assert!(heap.backing.expansions().is_empty());
}

#[test]
fn out_of_memory() {
    let mut heap = Heap::new(NoBacking, HeapConfig::new());

    assert!(heap.allocate(8, 0).is_none());
    assert_eq!(heap.aligned_allocate(64, 8, 0), Err(HeapError::OutOfMemory { size: 8, alignment: 64 }));
    assert_eq!(heap.statistics().failed_allocations, 2);
}

#[test]
fn zero_sized_allocations() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0, 0).unwrap();
    let b = heap.allocate(0, 0).unwrap();
    assert_ne!(a, b);

    unsafe {
        // null reallocates as an allocation, zero size as a free
        let c = heap.reallocate(null_mut(), 0x40, 0).unwrap();
        assert!(heap.reallocate(c.as_ptr(), 0, 0).is_none());

        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
        heap.free(null_mut());
    }

    let s = heap.statistics();
    assert_eq!(s.total_allocation_calls, 3);
    assert_eq!(s.total_free_calls, 3);
    assert!(heap.backing.corruptions().is_empty());
}

#[test]
fn reallocate_preserves_contents() {
    let mut heap = heap(HeapConfig::new());

    unsafe {
        let a = heap.allocate(0x40, 0).unwrap();
        let _fence = heap.allocate(0x40, 0).unwrap();
        a.as_ptr().write_bytes(0x3c, 0x40);

        // blocked above, so this moves
        let moved = heap.reallocate(a.as_ptr(), 0x400, 1).unwrap();
        assert_ne!(moved, a);
        assert!(filled_with(moved, 0x40, 0x3c));

        let shrunk = heap.reallocate(moved.as_ptr(), 0x10, 1).unwrap();
        assert_eq!(shrunk, moved);
        assert!(filled_with(shrunk, 0x10, 0x3c));
    }

    let s = heap.statistics();
    assert_eq!(s.total_allocation_calls, 3);
    assert_eq!(s.total_free_calls, 1);
    assert_eq!(s.allocations, 2);
    assert!(heap.validate());
}

#[test]
fn resize_in_place() {
    let mut heap = heap(HeapConfig::new());

    unsafe {
        let a = heap.allocate(0x40, 0).unwrap();

        let grown = heap.reallocate(a.as_ptr(), 0x200, 0).unwrap();
        assert_eq!(grown, a);
        assert!(heap.usable_size(a) >= 0x200);

        let _b = heap.allocate(0x40, 0).unwrap();

        let shrunk = heap.reallocate(a.as_ptr(), 0x20, 0).unwrap();
        assert_eq!(shrunk, a);
        assert_eq!(heap.usable_size(a), 0x20);
        assert!(heap.validate());

        // back into the space just given up
        let regrown = heap.reallocate(a.as_ptr(), 0x100, 0).unwrap();
        assert_eq!(regrown, a);
    }

    let s = heap.statistics();
    assert_eq!(s.total_allocation_calls, 2);
    assert_eq!(s.total_free_calls, 0);
    assert!(heap.validate());
}

#[test]
fn failed_grow_keeps_the_original() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x100, 0).unwrap();
    let _b = heap.allocate(0x100, 0).unwrap();
    unsafe { a.as_ptr().write_bytes(0x77, 0x100) };

    heap.backing.fail_expansions(true);
    assert!(unsafe { heap.reallocate(a.as_ptr(), 0x20000, 0) }.is_none());

    assert!(unsafe { filled_with(a, 0x100, 0x77) });
    assert_eq!(heap.statistics().failed_allocations, 1);
    assert_eq!(heap.statistics().allocations, 2);
    assert!(heap.validate());

    heap.backing.fail_expansions(false);
    let moved = unsafe { heap.reallocate(a.as_ptr(), 0x20000, 0) }.unwrap();
    assert!(unsafe { filled_with(moved, 0x100, 0x77) });
}

#[test]
fn double_free_is_reported_once() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x10, 0).unwrap();
    let _b = heap.allocate(0x10, 0).unwrap();
    unsafe { heap.free(a.as_ptr()) };

    let before = *heap.statistics();
    unsafe { heap.free(a.as_ptr()) };

    assert_eq!(heap.backing.corruptions(), [(CorruptionCode::DoubleFree, a.as_ptr() as usize)]);
    assert_eq!(*heap.statistics(), before);
    assert!(heap.validate());
}

#[test]
fn double_free_after_merging_downward() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x40, 0).unwrap();
    let b = heap.allocate(0x40, 0).unwrap();
    let _c = heap.allocate(0x40, 0).unwrap();
    unsafe {
        heap.free(a.as_ptr());
        heap.free(b.as_ptr());
    }

    let before = *heap.statistics();
    unsafe { heap.free(b.as_ptr()) };

    assert_eq!(heap.backing.corruptions(), [(CorruptionCode::DoubleFree, b.as_ptr() as usize)]);
    assert_eq!(*heap.statistics(), before);
    assert_eq!(heap.statistics().allocations, 1);
    assert!(heap.validate());
}

#[test]
fn double_free_after_merging_upward() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x40, 0).unwrap();
    let b = heap.allocate(0x40, 0).unwrap();
    let _c = heap.allocate(0x40, 0).unwrap();
    unsafe {
        heap.free(b.as_ptr());
        heap.free(a.as_ptr());
    }

    let before = *heap.statistics();
    unsafe {
        heap.free(b.as_ptr());
        heap.free(a.as_ptr());
    }

    assert_eq!(
        heap.backing.corruptions(),
        [(CorruptionCode::DoubleFree, b.as_ptr() as usize), (CorruptionCode::DoubleFree, a.as_ptr() as usize)]
    );
    assert_eq!(*heap.statistics(), before);
    assert!(heap.validate());
}

#[test]
fn corrupted_extent_header_is_reported_on_free() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x40, 0).unwrap();
    let ext = unsafe { extent::find(heap.extents, chunk::user_to_base(a.as_ptr())) }.unwrap();

    unsafe {
        (*ext.as_ptr()).chunks_end = (*ext.as_ptr()).chunks_end.add(0x1000);
        heap.free(a.as_ptr());
    }

    assert_eq!(heap.backing.corruptions(), [(CorruptionCode::BadExtent, ext.as_ptr() as usize)]);
    assert_eq!(heap.statistics().allocations, 1);
    assert!(heap.backing.contractions().is_empty());

    unsafe { (*ext.as_ptr()).chunks_end = (*ext.as_ptr()).chunks_end.sub(0x1000) };
    assert!(heap.validate());
}

#[test]
fn invalid_frees() {
    let mut heap = heap(HeapConfig::new());
    let foreign = Box::into_raw(Box::new([0u128; 4])).cast::<u8>();

    let a = heap.allocate(0x100, 0).unwrap();
    unsafe {
        a.as_ptr().write_bytes(0, 0x100);

        let misaligned = a.as_ptr().add(8);
        let interior = a.as_ptr().add(0x20);
        heap.free(misaligned);
        heap.free(interior);
        heap.free(foreign.add(CHUNK_UNIT));

        assert_eq!(
            heap.backing.corruptions(),
            [
                (CorruptionCode::InvalidFree, misaligned as usize),
                (CorruptionCode::InvalidFree, interior as usize),
                (CorruptionCode::InvalidFree, foreign as usize + CHUNK_UNIT),
            ]
        );

        drop(Box::from_raw(foreign.cast::<[u128; 4]>()));
    }

    assert_eq!(heap.statistics().allocations, 1);
    assert!(heap.validate());
}

#[test]
fn buffer_overrun_is_detected_on_free() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x40, 0).unwrap();
    let b = heap.allocate(0x40, 0).unwrap();
    let b_base = chunk::user_to_base(b.as_ptr());

    unsafe {
        assert_eq!(heap.usable_size(a), 0x40);
        a.as_ptr().write_bytes(0xcc, 0x48);
        heap.free(a.as_ptr());
    }

    assert_eq!(heap.backing.corruptions(), [(CorruptionCode::BufferOverrun, b_base as usize)]);
    assert_eq!(heap.statistics().allocations, 2);
}

#[test]
fn periodic_validation_interval() {
    let flags = HeapFlags::PERIODIC_VALIDATION;
    let mut heap = heap(HeapConfig::new().with_flags(flags).with_validation_interval(2));

    let a = heap.allocate(0x40, 0).unwrap();
    let _b = heap.allocate(0x40, 0).unwrap();

    let a_base = chunk::user_to_base(a.as_ptr());
    unsafe { (*chunk::header(a_base)).tag ^= 1 };
    // the tag isn't covered by the guard
    assert!(heap.validate());
    unsafe { (*chunk::header(a_base)).guard ^= 0x40 };

    let reports = |heap: &Heap<RecordingBacking>| heap.backing.corruptions().len();

    heap.allocate(0x40, 0).unwrap();
    assert_eq!(reports(&heap), 0);
    heap.allocate(0x40, 0).unwrap();
    assert_eq!(reports(&heap), 1);
    heap.allocate(0x40, 0).unwrap();
    assert_eq!(reports(&heap), 1);
    heap.allocate(0x40, 0).unwrap();
    assert_eq!(reports(&heap), 2);

    assert!(heap.backing.corruptions().iter().all(|&c| c == (CorruptionCode::CorruptedChunk, a_base as usize)));
    unsafe { (*chunk::header(a_base)).guard ^= 0x40 };
    assert!(heap.validate());
}

#[test]
fn whole_extents_are_released() {
    let mut heap = heap(HeapConfig::new());

    let a = heap.allocate(0x100, 0).unwrap();
    unsafe { heap.free(a.as_ptr()) };

    assert_eq!(heap.backing.contractions(), heap.backing.expansions());
    assert_eq!(heap.statistics().extent_count, 0);
    assert_eq!(heap.statistics().total_heap_size, 0);
    assert!(heap.statistics().max_heap_size > 0);

    // a refusal keeps the extent in use
    heap.backing.refuse_contractions(true);
    let b = heap.allocate(0x100, 0).unwrap();
    unsafe { heap.free(b.as_ptr()) };

    assert_eq!(heap.backing.contractions().len(), 1);
    assert_eq!(heap.statistics().extent_count, 1);
    assert!(heap.validate());

    let c = heap.allocate(0x100, 0).unwrap();
    assert_eq!(c, b);
    assert_eq!(heap.backing.expansions().len(), 2);
}

#[test]
fn tail_trimming() {
    const ARENA_SIZE: usize = 0x40000;
    let arena = Box::into_raw(Box::new([0u128; ARENA_SIZE / 16]));

    let config = HeapConfig::new().with_trim_threshold(0x2000);
    let mut heap = Heap::new(unsafe { RegionBacking::array(arena) }, config);

    let a = heap.allocate(0x100, 0).unwrap();
    let b = heap.allocate(0x8000, 0).unwrap();
    assert_eq!(heap.backing.used(), 0x10000);

    unsafe { heap.free(b.as_ptr()) };
    let used = heap.backing.used();
    assert!(used < 0x1000 + 0x200);
    assert_eq!(heap.statistics().total_heap_size, used);
    assert!(heap.validate());

    let c = heap.allocate(0x8000, 0).unwrap();
    assert_eq!(heap.statistics().extent_count, 2);
    assert!(heap.validate());

    unsafe {
        heap.free(c.as_ptr());
        heap.free(a.as_ptr());
    }
    assert_eq!(heap.backing.used(), 0);
    assert_eq!(heap.statistics().total_heap_size, 0);

    drop(heap);
    drop(unsafe { Box::from_raw(arena) });
}

#[test]
fn no_partial_frees() {
    const ARENA_SIZE: usize = 0x40000;
    let arena = Box::into_raw(Box::new([0u128; ARENA_SIZE / 16]));

    let config = HeapConfig::new().with_trim_threshold(0x2000).with_flags(HeapFlags::NO_PARTIAL_FREES);
    let mut heap = Heap::new(unsafe { RegionBacking::array(arena) }, config);

    let a = heap.allocate(0x100, 0).unwrap();
    let b = heap.allocate(0x8000, 0).unwrap();

    unsafe { heap.free(b.as_ptr()) };
    assert_eq!(heap.backing.used(), 0x10000);

    // whole extents still go back
    unsafe { heap.free(a.as_ptr()) };
    assert_eq!(heap.backing.used(), 0);

    drop(heap);
    drop(unsafe { Box::from_raw(arena) });
}

#[test]
fn destroy_returns_every_region() {
    let mut heap = heap(HeapConfig::new().with_direct_allocation_threshold(0x8000).with_minimum_extent_size(0x2000));
    let rng = fastrand::Rng::with_seed(7);

    let mut live = Vec::new();
    for _ in 0..200 {
        let size = if rng.u8(0..10) == 0 { rng.usize(0x8000..0x10000) } else { rng.usize(1..0x800) };
        live.push(heap.allocate(size, 0).unwrap());
    }
    for ptr in live.iter().step_by(2) {
        unsafe { heap.free(ptr.as_ptr()) };
    }
    assert!(heap.statistics().extent_count > 1);
    assert!(heap.statistics().direct_allocations > 0);

    heap.destroy();
    assert!(!heap.is_live());

    let mut expansions = heap.backing.expansions().to_vec();
    let mut contractions = heap.backing.contractions().to_vec();
    expansions.sort_unstable();
    contractions.sort_unstable();
    assert_eq!(expansions, contractions);
    assert_eq!(heap.backing.held_bytes(), 0);
    assert_eq!(heap.statistics().total_heap_size, 0);
    assert!(heap.backing.corruptions().is_empty());
}

#[test]
fn double_destroy() {
    let mut heap = heap(HeapConfig::new());
    let _ = heap.allocate(0x100, 0).unwrap();

    heap.destroy();
    assert!(heap.allocate(0x100, 0).is_none());

    heap.destroy();
    let location = &heap as *const Heap<RecordingBacking> as usize;
    assert_eq!(heap.backing.corruptions(), [(CorruptionCode::DoubleDestroy, location)]);
}

#[test]
fn destroy_hands_back_region_memory() {
    let arena = Box::into_raw(Box::new([0u128; 0x1000]));

    {
        let mut heap = Heap::new(unsafe { RegionBacking::array(arena) }, HeapConfig::new().with_minimum_extent_size(0x4000));
        heap.allocate(0x100, 0).unwrap();
        assert!(heap.backing.used() > 0);

        heap.destroy();
        assert_eq!(heap.backing.used(), 0);
    }

    drop(unsafe { Box::from_raw(arena) });
}

#[test]
fn random_workload() {
    for collect_tags in [false, true] {
        let mut flags = HeapFlags::PERIODIC_VALIDATION;
        flags.set(HeapFlags::COLLECT_TAG_STATISTICS, collect_tags);

        let mut heap = heap(
            HeapConfig::new()
                .with_heap_seed(0xdead_beef)
                .with_direct_allocation_threshold(0x2000)
                .with_minimum_extent_size(0x4000)
                .with_flags(flags)
                .with_validation_interval(64),
        );

        let rng = fastrand::Rng::with_seed(0x5eed);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let size = || if rng.u8(0..20) == 0 { rng.usize(0x1800..0x4000) } else { rng.usize(1..0x200) };

        for i in 0..4000 {
            let fill = i as u8;
            let tag = rng.u32(0..4);

            match rng.u8(0..10) {
                0..=4 => {
                    let size = size();
                    let ptr = if rng.bool() {
                        heap.allocate(size, tag).unwrap()
                    } else {
                        let align = 1 << rng.u32(0..10);
                        let ptr = heap.aligned_allocate(align, size, tag).unwrap();
                        assert_eq!(ptr.as_ptr() as usize % align, 0);
                        ptr
                    };

                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    live.push((ptr, size, fill));
                }
                5..=7 if !live.is_empty() => {
                    let (ptr, size, byte) = live.swap_remove(rng.usize(..live.len()));
                    unsafe {
                        assert!(filled_with(ptr, size, byte));
                        heap.free(ptr.as_ptr());
                    }
                }
                8..=9 if !live.is_empty() => {
                    let index = rng.usize(..live.len());
                    let (ptr, old_size, byte) = live[index];
                    let new_size = size();

                    unsafe {
                        let ptr = heap.reallocate(ptr.as_ptr(), new_size, tag).unwrap();
                        assert!(filled_with(ptr, old_size.min(new_size), byte));
                        ptr.as_ptr().write_bytes(fill, new_size);
                        live[index] = (ptr, new_size, fill);
                    }
                }
                _ => {}
            }
        }

        assert!(heap.validate());

        if collect_tags {
            let active: usize = (0..4).filter_map(|tag| heap.statistics_for_tag(tag)).map(|s| s.active_allocation_count).sum();
            assert_eq!(active, live.len());
        }

        for (ptr, size, byte) in live.drain(..) {
            unsafe {
                assert!(filled_with(ptr, size, byte));
                heap.free(ptr.as_ptr());
            }
        }

        let s = *heap.statistics();
        assert!(heap.backing.corruptions().is_empty());
        assert!(heap.validate());
        assert_eq!(s.outstanding(), 0);
        assert_eq!(s.direct_allocation_size, 0);
        assert_eq!(s.total_allocation_calls, s.total_free_calls);
        assert_eq!(s.total_heap_size, heap.backing.held_bytes());

        if collect_tags {
            assert!((0..4).filter_map(|tag| heap.statistics_for_tag(tag)).all(|s| s.active_size == 0));
        } else {
            // nothing is left holding on to an extent
            assert_eq!(heap.backing.held_bytes(), 0);
            assert_eq!(s.extent_count, 0);
        }

        heap.destroy();
        assert_eq!(heap.backing.held_bytes(), 0);
    }
}
