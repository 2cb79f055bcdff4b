//! This is a very minimal example showing a HeapGrower extending the heap.

fn main() {
    #[cfg(feature = "use_libc")]
    {
        use tag_allocator::allocators::{HeapGrower, LibcHeapGrower};

        // LibcHeapGrower moves the program break through libc's sbrk.
        let mut grower = LibcHeapGrower::default();
        let a = unsafe { grower.extend(64) }.expect("sbrk failed");
        let b = unsafe { grower.extend(64) }.expect("sbrk failed");
        println!("Extended twice: {:p}, {:p}", a.as_ptr(), b.as_ptr());
        println!("High address: {:p}", grower.high_address());
        println!("Growths: {}, bytes: {}", grower.growths, grower.grown_bytes);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64", not(feature = "use_libc")))]
    {
        use tag_allocator::allocators::{HeapGrower, SyscallHeapGrower};

        // SyscallHeapGrower makes raw brk syscalls.
        let mut grower = SyscallHeapGrower::default();
        let a = unsafe { grower.extend(64) }.expect("brk failed");
        let b = unsafe { grower.extend(64) }.expect("brk failed");
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 64);
        println!("Extended twice, contiguously: {:p}, {:p}", a.as_ptr(), b.as_ptr());
        println!("High address: {:p}", grower.high_address());
        println!("Growths: {}, bytes: {}", grower.growths, grower.grown_bytes);
    }
}
