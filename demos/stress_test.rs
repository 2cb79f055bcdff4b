//! An example program that uses the provided allocator as the global
//! allocator, creates and destroys a large number of objects, and checks
//! heap consistency along the way.

use tag_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// This is the magic line that routes all allocations through our allocator.
#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Minimum number of live objects before we start destroying any
const MIN_ALLOCATIONS: usize = 1024;
// Total number of create/destroy steps
const ALLOCATIONS: usize = 64 * 1024;
// Largest object to allocate, in u64s
const MAX_LEN: usize = 4096;

#[derive(Default)]
struct RandomObjects {
    allocated: Vec<Vec<u64>>,
    max_len: usize,
}

impl RandomObjects {
    fn new(max_len: usize) -> Self {
        RandomObjects {
            allocated: Vec::new(),
            max_len: max_len.max(8),
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        let len = Uniform::new_inclusive(1, self.max_len).sample(rng);
        let obj: Vec<u64> = (0..len as u64).collect();
        self.allocated.push(obj);
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.allocated.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.allocated.len()).sample(rng);
        let obj = self.allocated.swap_remove(ix);
        drop(obj);
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [ALLOCATIONS] [MIN_ALLOCATIONS] [MAX_LEN]", args[0]);
        return;
    }
    let mut allocations: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ALLOCATIONS);
    let min_allocations: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MIN_ALLOCATIONS);
    if allocations < min_allocations {
        allocations = min_allocations;
    }
    let max_len: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(MAX_LEN);

    env_logger::init();
    println!("Running stress test.\n\nParameters:");
    println!("    {} total steps", allocations);
    println!("    {} objects created before any are destroyed", min_allocations);
    println!("    {} max allocated object length", max_len);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut objects = RandomObjects::new(max_len);

    for i in 1..=allocations {
        if objects.allocated.len() < min_allocations || rng.gen_bool(0.5) {
            objects.create(&mut rng);
        } else {
            objects.destroy(&mut rng);
        }

        let stats = ALLOCATOR.check().expect("heap must stay consistent");
        if i % 1024 == 0 {
            println!("Step {} / {}", i, allocations);
            let count = objects.allocated.len();
            let total_len: usize = objects.allocated.iter().map(|v| v.len()).sum();
            println!("    Live objects: {}, total length: {}", count, total_len);
            println!("    Heap stats: {:?}", stats);
        }
    }

    while !objects.allocated.is_empty() {
        objects.destroy(&mut rng);
        ALLOCATOR.check().expect("heap must stay consistent");
    }

    let stats = ALLOCATOR.check().expect("heap must stay consistent");
    println!("\nFinished.");
    println!("    Heap stats: {:?}", stats);
}
