#![no_std]

//! A heap allocator built on an implicit free list with boundary tags.
//!
//! Every block in the heap carries a 4-byte tag at each end encoding its
//! size and allocation state. Allocation walks the blocks in address order
//! and takes the first free block that fits (splitting off any remainder);
//! freeing flips the tags and merges with free neighbors immediately, using
//! the footer tags to find the previous block in constant time. When no
//! block fits, the heap grows at the top: one contiguous region obtained
//! from a pluggable [`HeapGrower`](allocators::HeapGrower).
//!
//! The usual entry point is the global allocator:
//!
//! ```no_run
//! use tag_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v = vec![1, 2, 3];
//!     assert_eq!(v.len(), 3);
//! }
//! ```
//!
//! For tests, or for a heap you own outright, hold a
//! [`RawAlloc`](allocators::RawAlloc) directly and call `allocate`, `free`,
//! and `reallocate` on it. [`RawAlloc::check`](allocators::RawAlloc::check)
//! walks the whole heap and verifies the block-format invariants; the tests
//! run it after every operation.
//!
//! By default the heap grows through raw `brk` syscalls (Linux x86-64).
//! Enable the `use_libc` feature to go through `libc::sbrk` instead.

pub mod allocators;
pub mod heap;
mod tags;
#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
mod unix;

#[cfg(any(feature = "use_libc", all(target_os = "linux", target_arch = "x86_64")))]
pub use allocators::UnixAllocator;
