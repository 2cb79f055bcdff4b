use core::ptr::null_mut;

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

use tag_allocator::allocators::{block_words, ArenaHeap, RawAlloc};

const SLOTS: usize = 128;
const STEPS: usize = 10 * 1024;

/// One live allocation: payload address, requested bytes, fill byte.
#[derive(Copy, Clone)]
struct Slot {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

const EMPTY: Slot = Slot {
    ptr: null_mut(),
    size: 0,
    fill: 0,
};

/// Bytes the heap charges for a request: block words times the word size.
fn charged(size: usize) -> usize {
    block_words(size).unwrap() as usize * 8
}

/// Run the consistency checker and cross-check its accounting against the
/// live slots: used bytes must equal the sum of the live blocks, and the
/// provider must have handed over exactly the heap plus the two words of
/// padding and sentinels.
fn validate(allocator: &RawAlloc<ArenaHeap>, slots: &[Slot]) {
    let stats = allocator
        .check()
        .unwrap_or_else(|violation| panic!("corrupt heap: {}", violation));
    let live_bytes: usize = slots
        .iter()
        .filter(|slot| !slot.ptr.is_null())
        .map(|slot| charged(slot.size))
        .sum();
    assert_eq!(stats.heap_bytes - stats.free_bytes, live_bytes);
    assert_eq!(allocator.grower.size, stats.heap_bytes + 16);
}

fn check_payload(slot: &Slot) {
    for i in 0..slot.size {
        assert_eq!(unsafe { slot.ptr.add(i).read() }, slot.fill);
    }
}

#[test]
fn random_alloc_free_realloc() {
    let mut allocator = RawAlloc::new(ArenaHeap::default());
    let mut slots = [EMPTY; SLOTS];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for step in 0..STEPS {
        let slot = slots.choose_mut(&mut rng).unwrap();

        if slot.ptr.is_null() {
            // Allocate into the empty slot and pattern-fill the payload.
            let size = range.sample(&mut rng) * range.sample(&mut rng);
            let ptr = unsafe { allocator.allocate(size) };
            if ptr.is_null() {
                // Arena exhausted for now; freeing other slots will recover.
                log::info!("allocation of {} bytes refused at step {}", size, step);
            } else {
                assert_eq!(ptr as usize % 16, 0);
                let fill = (step % 255) as u8 + 1;
                unsafe { core::ptr::write_bytes(ptr, fill, size) };
                *slot = Slot { ptr, size, fill };
            }
        } else if rng.gen_bool(0.25) {
            // Resize, checking that the common prefix survived the move.
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let kept = core::cmp::min(slot.size, new_size);
            let ptr = unsafe { allocator.reallocate(slot.ptr, new_size) };
            if ptr.is_null() {
                // A failed resize must leave the old block untouched.
                check_payload(slot);
            } else {
                for i in 0..kept {
                    assert_eq!(unsafe { ptr.add(i).read() }, slot.fill);
                }
                unsafe { core::ptr::write_bytes(ptr, slot.fill, new_size) };
                slot.ptr = ptr;
                slot.size = new_size;
            }
        } else {
            check_payload(slot);
            unsafe { allocator.free(slot.ptr) };
            *slot = EMPTY;
        }

        validate(&allocator, &slots);
    }

    // Free everything: coalescing must fold the heap back into a single
    // free block covering the whole region.
    for slot in slots.iter_mut() {
        if !slot.ptr.is_null() {
            unsafe { allocator.free(slot.ptr) };
            *slot = EMPTY;
        }
    }
    let stats = allocator.check().unwrap();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, stats.heap_bytes);
    log::info!("final heap: {}", allocator);
}
