use std::ptr::NonNull;

use crate::Pointer;

/// Platform specific virtual memory. The arena reserves one mapping when a
/// heap is created and returns it when the heap is dropped; nothing else
/// about the underlying kernel APIs leaks past this module.
trait VirtualMemory {
    /// Maps `length` bytes of zeroed read-write memory.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Returns a mapping previously obtained from [`Self::reserve`], with
    /// the same `length`.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`VirtualMemory`] for each OS.
struct Platform;

/// Cached page size. Only known at runtime, so it is looked up once and
/// reused afterwards.
static mut PAGE_SIZE: usize = 0;

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`VirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convenience wrapper for [`VirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Read-write, private to this process and not backed by any
            // file. See https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // Nothing sensible to do; the mapping stays alive and the
                // process leaks it.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call; pages are materialized
            // lazily on first touch, same as anonymous mmap.
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires a length of 0 and frees the whole
            // reservation made by VirtualAlloc.
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                // Same story as munmap above.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so the global allocator stands in for the kernel.
    //! This also lets Miri catch a heap that forgets to return its arena.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, VirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
