//! A minimal smoke test routing every Rust allocation through the allocator.

use tag_allocator::UnixAllocator;

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn main() {
    env_logger::init();
    println!("Hello, World!");

    let s: String = "abc".to_owned();
    println!("Got a string {}", s);

    let mut v = vec![0, 1, 2, 3];
    for n in 10..2048 {
        v.push(n);
    }
    println!("Got a vec of {} elements", v.len());

    let stats = ALLOCATOR.check().expect("heap should be consistent");
    println!("Heap stats: {:?}", stats);
}
