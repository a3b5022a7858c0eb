#![no_main]

use std::ptr::NonNull;

use allocator_api2::alloc::Global;
use tagheap::*;

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory with the given size, tag and an alignment of 1 << (align_bit % 13)
    Alloc { size: u16, align_bit: u8, tag: u8 },
    /// Free the ith allocation
    Free { index: u8 },
    /// Reallocate the ith allocation
    Realloc { index: u8, new_size: u16, tag: u8 },
    /// Run the validator
    Validate,
}
use Actions::*;

#[derive(Arbitrary, Debug)]
struct Config {
    seed: u32,
    direct_threshold: u16,
    collect_tags: bool,
    no_partial_frees: bool,
}

/// Panics on any report, there should be none.
#[derive(Debug)]
struct StrictBacking(AllocatorBacking<Global>);

unsafe impl Backing for StrictBacking {
    fn expand(&mut self, size: usize, tag: u32) -> Option<NonNull<[u8]>> {
        self.0.expand(size, tag)
    }

    unsafe fn contract(&mut self, base: NonNull<u8>, size: usize) -> bool {
        self.0.contract(base, size)
    }

    fn on_corruption(&mut self, code: CorruptionCode, location: *const u8) {
        panic!("{} at {:p}", code, location);
    }
}

fuzz_target!(|input: (Config, Vec<Actions>)| {
    let (config, actions) = input;

    let mut flags = HeapFlags::empty();
    flags.set(HeapFlags::COLLECT_TAG_STATISTICS, config.collect_tags);
    flags.set(HeapFlags::NO_PARTIAL_FREES, config.no_partial_frees);

    let mut heap = Heap::new(
        StrictBacking(AllocatorBacking::new(Global)),
        HeapConfig::new()
            .with_heap_seed(config.seed)
            .with_direct_allocation_threshold(config.direct_threshold as usize)
            .with_minimum_extent_size(0x2000)
            .with_trim_threshold(0x1000)
            .with_flags(flags),
    );

    let mut allocations: Vec<(NonNull<u8>, usize, u8)> = vec![];

    for action in actions {
        match action {
            Alloc { size, align_bit, tag } => {
                let size = size as usize;
                let align = 1usize << (align_bit % 13);

                let Ok(ptr) = heap.aligned_allocate(align, size, tag as u32) else { continue };
                assert_eq!(ptr.as_ptr() as usize % align, 0);

                unsafe { ptr.as_ptr().write_bytes(tag, size) };
                allocations.push((ptr, size, tag));
            }
            Free { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, size, byte) = allocations.swap_remove(index as usize);
                unsafe {
                    assert!(std::slice::from_raw_parts(ptr.as_ptr(), size).iter().all(|&b| b == byte));
                    heap.free(ptr.as_ptr());
                }
            }
            Realloc { index, new_size, tag } => {
                if index as usize >= allocations.len() { continue; }
                if new_size == 0 { continue; }

                let (ptr, old_size, byte) = allocations[index as usize];
                let new_size = new_size as usize;

                if let Some(ptr) = unsafe { heap.reallocate(ptr.as_ptr(), new_size, tag as u32) } {
                    unsafe {
                        let kept = old_size.min(new_size);
                        assert!(std::slice::from_raw_parts(ptr.as_ptr(), kept).iter().all(|&b| b == byte));
                        ptr.as_ptr().write_bytes(tag, new_size);
                    }
                    allocations[index as usize] = (ptr, new_size, tag);
                }
            }
            Validate => assert!(heap.validate()),
        }
    }

    for (ptr, _, _) in allocations {
        unsafe { heap.free(ptr.as_ptr()) };
    }

    assert!(heap.validate());
    assert_eq!(heap.statistics().outstanding(), 0);
    heap.destroy();
});
