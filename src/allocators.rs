//! Allocator types, from the raw single-threaded core to a global allocator.
//!
//! ## Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager: one [`HeapGrower`] for
//! obtaining memory, one [`BlockHeap`](crate::heap) managing it as an
//! implicit free list. It carries the public operations (`init`,
//! `allocate`, `free`, `reallocate`) plus the consistency checker. Not
//! thread-safe, so it cannot serve as a global allocator by itself.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! Wraps a `RawAlloc` in a spin lock with one-shot lazy initialization,
//! which is enough to implement [`core::alloc::GlobalAlloc`].
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `GenericAllocator` over the configured Unix grower: raw `brk` syscalls
//! by default, `libc::sbrk` with the `use_libc` feature.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! The memory-provider contract: extend one contiguous region, monotonically.
//! [`ArenaHeap`] implements it over an in-struct array and is what the tests
//! and demos use.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use log::debug;
use spin::{Mutex, MutexGuard};

use crate::heap::{BlockHeap, HeapStats, Violation, INIT_BYTES};
use crate::tags::{BlockPtr, DWORD_SIZE, OVERHEAD_BYTES, WORD_SIZE};
#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
use crate::unix;

/// Words needed for a block holding `size` payload bytes: payload plus one
/// word of tag overhead, rounded up to a double-word multiple. `None` when
/// the request cannot be represented.
pub fn block_words(size: usize) -> Option<u32> {
    let bytes = size
        .checked_add(OVERHEAD_BYTES)?
        .checked_add(DWORD_SIZE - 1)?;
    u32::try_from((bytes / DWORD_SIZE) * 2).ok()
}

/// The memory provider: a single contiguous region of raw bytes, grown
/// monotonically and never reclaimed.
pub trait HeapGrower {
    type Err;

    /// Extend the region by exactly `bytes`, returning the base address of
    /// the appended bytes.
    ///
    /// # Safety
    ///
    /// On success the returned memory must be writable, untracked by any
    /// other code, and must start exactly where the region previously ended.
    unsafe fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The current exclusive end of the region: one past the last valid
    /// byte. May be null before the first extension for providers that
    /// discover their region lazily.
    fn high_address(&self) -> *mut u8;
}

/// Bytes in an [`ArenaHeap`].
const ARENA_BYTES: usize = 256 * 1024;

// The backing array, aligned so the first block's base lands on a
// double-word boundary without any runtime adjustment.
#[repr(C, align(16))]
struct Arena([u8; ARENA_BYTES]);

/// A provider backed by an array inside the struct itself: a pretend heap
/// for tests and demos.
///
/// Handed-out addresses point into the struct, so an allocator using an
/// `ArenaHeap` must not be moved after its first allocation.
pub struct ArenaHeap {
    /// Bytes handed out so far.
    pub size: usize,
    arena: Arena,
}

impl ArenaHeap {
    pub const CAPACITY: usize = ARENA_BYTES;
}

impl Default for ArenaHeap {
    fn default() -> Self {
        ArenaHeap {
            size: 0,
            arena: Arena([0; ARENA_BYTES]),
        }
    }
}

/// The arena has a fixed capacity and refused to grow past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaOverflowError;

impl fmt::Display for ArenaOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arena capacity exhausted")
    }
}

impl HeapGrower for ArenaHeap {
    type Err = ArenaOverflowError;

    unsafe fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, Self::Err> {
        let grown = self.size.checked_add(bytes).ok_or(ArenaOverflowError)?;
        if grown > ARENA_BYTES {
            return Err(ArenaOverflowError);
        }
        let ptr = self.arena.0.as_mut_ptr().add(self.size);
        self.size = grown;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn high_address(&self) -> *mut u8 {
        self.arena.0.as_ptr().wrapping_add(self.size) as *mut u8
    }
}

/// A provider growing the process data segment through raw `brk` syscalls.
#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
#[derive(Default)]
pub struct SyscallHeapGrower {
    /// Successful extensions, for diagnostics.
    pub growths: usize,
    /// Total bytes obtained from the kernel.
    pub grown_bytes: usize,
}

/// The kernel refused to move the program break.
#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrkError;

#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
impl fmt::Display for BrkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the program break could not be moved")
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
impl HeapGrower for SyscallHeapGrower {
    type Err = BrkError;

    unsafe fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, Self::Err> {
        let base = unix::sbrk(bytes).ok_or(BrkError)?;
        self.growths += 1;
        self.grown_bytes += bytes;
        Ok(base)
    }

    fn high_address(&self) -> *mut u8 {
        unsafe { unix::brk(null_mut()) }
    }
}

/// A provider growing the data segment through `libc::sbrk`.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcHeapGrower {
    /// Successful extensions, for diagnostics.
    pub growths: usize,
    /// Total bytes obtained from libc.
    pub grown_bytes: usize,
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    unsafe fn extend(&mut self, bytes: usize) -> Result<NonNull<u8>, Self::Err> {
        let ptr = libc::sbrk(bytes as libc::intptr_t);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }
        self.growths += 1;
        self.grown_bytes += bytes;
        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }

    fn high_address(&self) -> *mut u8 {
        unsafe { libc::sbrk(0) as *mut u8 }
    }
}

/// Heap setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The provider refused the initial request.
    ProviderFailed,
    /// The provider's region does not start on a double-word boundary.
    Misaligned,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::ProviderFailed => write!(f, "the memory provider refused the initial heap"),
            InitError::Misaligned => write!(f, "the memory provider returned a misaligned region"),
        }
    }
}

/// A raw allocator: grows the heap on demand, hands out payload addresses,
/// and reuses freed blocks. Memory is never returned to the provider.
///
/// Single-threaded; wrap it in a [`GenericAllocator`] to share it.
pub struct RawAlloc<G> {
    pub grower: G,
    heap: Option<BlockHeap>,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc {
            grower: G::default(),
            heap: None,
        }
    }
}

impl<G> fmt::Display for RawAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.heap {
            Some(heap) => heap.fmt(f),
            None => write!(f, "Heap(uninitialized)"),
        }
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    pub fn new(grower: G) -> Self {
        RawAlloc { grower, heap: None }
    }

    /// Set up the heap: one region of eight words holding the sentinels and
    /// a single free block. Idempotent. `allocate` calls this lazily on
    /// first use, so calling it directly is only needed to observe failure.
    pub fn init(&mut self) -> Result<(), InitError> {
        if self.heap.is_some() {
            return Ok(());
        }
        let region =
            unsafe { self.grower.extend(INIT_BYTES) }.map_err(|_| InitError::ProviderFailed)?;
        if region.as_ptr() as usize % DWORD_SIZE != 0 {
            return Err(InitError::Misaligned);
        }
        let heap = unsafe { BlockHeap::bootstrap(region) };
        debug_assert_eq!(heap.end(), self.grower.high_address());
        debug_assert!(heap.check().is_ok());
        self.heap = Some(heap);
        Ok(())
    }

    /// Allocate `size` bytes and return the payload address, aligned to a
    /// double word. Returns null when `size` is zero, when the request
    /// cannot be represented, or when the provider is out of memory.
    ///
    /// # Safety
    ///
    /// The returned region is uninitialized, and the usual allocator rules
    /// apply; see [`GlobalAlloc`] for details.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        if self.heap.is_none() && self.init().is_err() {
            return null_mut();
        }
        let words = match block_words(size) {
            Some(words) => words,
            None => return null_mut(),
        };
        let heap = match self.heap.as_mut() {
            Some(heap) => heap,
            None => return null_mut(),
        };

        if let Some(b) = heap.find_fit(words) {
            heap.place(b, words);
            debug!("allocated {} bytes in {} words at {:p}", size, words, b.base());
            return b.base();
        }

        // No fit anywhere: grow the heap. A free block at the tail counts
        // toward the request, so the new region merges with it instead of
        // leaving a short block beside it.
        let tail = heap.tail_free_words();
        debug_assert!(tail < words);
        let bytes = (words - tail) as usize * WORD_SIZE;
        let region = match self.grower.extend(bytes) {
            Ok(region) => region,
            Err(_) => {
                debug!("heap extension of {} bytes refused", bytes);
                return null_mut();
            }
        };
        if region.as_ptr() != heap.end() {
            // The provider stopped extending our region contiguously;
            // nothing can be built on memory the block walk cannot reach.
            debug!("provider returned a non-contiguous region, treating as out of memory");
            return null_mut();
        }
        let b = heap.absorb(bytes);
        heap.place(b, words);
        debug!(
            "allocated {} bytes in {} words at {:p} after extending by {}",
            size,
            words,
            b.base(),
            bytes
        );
        b.base()
    }

    /// Free the block at payload address `ptr`, merging it with free
    /// neighbors immediately.
    ///
    /// Total: null, foreign, misaligned, and already-free addresses are
    /// ignored (with a debug-log breadcrumb), as is any call before
    /// initialization.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` previously returned by this allocator must not be
    /// used again after being freed.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let heap = match self.heap.as_mut() {
            Some(heap) => heap,
            None => {
                debug!("free of {:p} before initialization ignored", ptr);
                return;
            }
        };
        if !heap.contains(ptr) || ptr as usize % DWORD_SIZE != 0 {
            debug!("free of {:p} outside the heap ignored", ptr);
            return;
        }
        let b = BlockPtr::from_base(NonNull::new_unchecked(ptr));
        if !b.is_allocated() {
            debug!("free of unallocated block {:p} ignored", ptr);
            return;
        }
        debug!("freeing block {:p} ({} words)", ptr, b.size_words());
        heap.free_block(b);
    }

    /// Resize the block at `ptr` to hold `size` bytes.
    ///
    /// Null `ptr` behaves as `allocate(size)`; zero `size` behaves as
    /// `free(ptr)` and returns null. Otherwise the block is resized in
    /// place when possible (shrinking, or growing into a free successor)
    /// and moved otherwise, copying the payload. On a failed move the
    /// original block is left intact and null is returned.
    ///
    /// # Safety
    ///
    /// As for [`allocate`](RawAlloc::allocate) and [`free`](RawAlloc::free);
    /// a moved block's old address must not be used again.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }
        let words = match block_words(size) {
            Some(words) => words,
            None => return null_mut(),
        };
        let heap = match self.heap.as_mut() {
            Some(heap) => heap,
            None => {
                debug!("reallocate of {:p} before initialization ignored", ptr);
                return null_mut();
            }
        };
        if !heap.contains(ptr) || ptr as usize % DWORD_SIZE != 0 {
            debug!("reallocate of {:p} outside the heap ignored", ptr);
            return null_mut();
        }
        let b = BlockPtr::from_base(NonNull::new_unchecked(ptr));
        if !b.is_allocated() {
            debug!("reallocate of unallocated block {:p} ignored", ptr);
            return null_mut();
        }

        let old_words = b.size_words();
        if words == old_words {
            return ptr;
        }

        if words < old_words {
            // Shrink in place; the tail goes back through coalescing so a
            // free successor merges with it right away.
            b.write(words, true);
            let tail = b.next();
            tail.write(old_words - words, false);
            heap.coalesce(tail);
            debug!("shrank block {:p} from {} to {} words", ptr, old_words, words);
            return ptr;
        }

        let next = b.next();
        if !next.is_allocated() {
            let total = old_words + next.size_words();
            if total >= words {
                // Grow in place by absorbing the free successor, splitting
                // off whatever is left of it.
                b.write(words, true);
                if total > words {
                    b.next().write(total - words, false);
                }
                debug!(
                    "grew block {:p} from {} to {} words in place",
                    ptr, old_words, words
                );
                return ptr;
            }
        }

        let new = self.allocate(size);
        if new.is_null() {
            return null_mut();
        }
        let copy = core::cmp::min(size, old_words as usize * WORD_SIZE - OVERHEAD_BYTES);
        core::ptr::copy_nonoverlapping(ptr, new, copy);
        self.free(ptr);
        debug!("moved block {:p} to {:p} ({} bytes copied)", ptr, new, copy);
        new
    }

    /// Walk the whole heap and verify its invariants; see
    /// [`BlockHeap::check`](crate::heap). An uninitialized allocator is
    /// trivially consistent.
    pub fn check(&self) -> Result<HeapStats, Violation> {
        match &self.heap {
            Some(heap) => heap.check(),
            None => Ok(HeapStats::default()),
        }
    }
}

/// A thread-safe allocator: a spin lock around a [`RawAlloc`], with an
/// atomic gate so a static instance can initialize itself on first use.
pub struct GenericAllocator<G> {
    // Values:
    // - 0: untouched
    // - 1: initialization in progress
    // - 2: initialized
    init: AtomicU8,
    raw: MaybeUninit<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: MaybeUninit::uninit(),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying `RawAlloc`, constructing it if this
    /// is the first use.
    ///
    /// # Safety
    ///
    /// Allocation is blocked while the returned guard is held, so the caller
    /// must not allocate before dropping it.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<G>> {
        // One thread moves the gate 0 -> 1, builds the mutex, then publishes
        // it with 2; everyone else spins until the 2 is visible. SeqCst
        // everywhere: this is far off the hot path.
        match self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(0) => {
                let raw_mut = self.raw.as_ptr() as *mut Mutex<RawAlloc<G>>;
                raw_mut.write(Mutex::new(RawAlloc::default()));
                self.init.store(2, Ordering::SeqCst);
                return (*raw_mut).lock();
            }
            Err(2) => {}
            Err(1) => loop {
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    1 => continue,
                    2 => break,
                    state => unreachable!("unexpected allocator init state {}", state),
                }
            },
            state => unreachable!("unexpected allocator init state {:?}", state),
        }

        (*self.raw.as_ptr()).lock()
    }

    /// Run the consistency checker on the wrapped allocator.
    pub fn check(&self) -> Result<HeapStats, Violation> {
        unsafe { self.get_raw().check() }
    }
}

unsafe impl<G: HeapGrower + Default> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are double-word aligned and nothing more.
        if layout.align() > DWORD_SIZE {
            return null_mut();
        }
        self.get_raw().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.get_raw().free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DWORD_SIZE {
            return null_mut();
        }
        self.get_raw().reallocate(ptr, new_size)
    }
}

/// The global-allocator entry point for Unix: a [`GenericAllocator`] over
/// the configured data-segment grower.
#[cfg(any(feature = "use_libc", all(target_os = "linux", target_arch = "x86_64")))]
#[derive(Default)]
pub struct UnixAllocator {
    #[cfg(feature = "use_libc")]
    alloc: GenericAllocator<LibcHeapGrower>,

    #[cfg(not(feature = "use_libc"))]
    alloc: GenericAllocator<SyscallHeapGrower>,
}

#[cfg(any(feature = "use_libc", all(target_os = "linux", target_arch = "x86_64")))]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    /// Run the consistency checker on the global heap.
    pub fn check(&self) -> Result<HeapStats, Violation> {
        self.alloc.check()
    }
}

#[cfg(any(feature = "use_libc", all(target_os = "linux", target_arch = "x86_64")))]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
