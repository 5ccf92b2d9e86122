use std::ptr::NonNull;

use crate::{error::AllocError, platform};

/// The growth primitive underneath the heap. One contiguous mapping is
/// reserved up front; [`Arena::sbrk`] then hands out pieces of it from low
/// to high addresses by advancing a break offset, so every grant is
/// contiguous with and immediately follows all previously granted memory.
/// The break never retreats while the heap is alive; the whole mapping goes
/// back to the platform at once when the arena is dropped.
///
/// ```text
/// base                 base + brk                  base + capacity
///  |                        |                             |
///  v                        v                             v
///  +------------------------+-----------------------------+
///  |     granted memory     |     reserved, ungranted     |
///  +------------------------+-----------------------------+
/// ```
pub(crate) struct Arena {
    /// Base address of the mapping. Page aligned, so also word aligned.
    base: NonNull<u8>,
    /// Bytes granted so far, relative to `base`.
    brk: usize,
    /// Total size of the mapping in bytes.
    capacity: usize,
}

impl Arena {
    /// Reserves a mapping large enough for `capacity` bytes, rounded up to
    /// whole pages and to at least one page.
    pub fn reserve(capacity: usize) -> Result<Self, AllocError> {
        let page = platform::page_size();
        let pages = capacity.div_ceil(page).max(1);
        let capacity = pages * page;

        match unsafe { platform::reserve(capacity) } {
            Some(base) => Ok(Self {
                base,
                brk: 0,
                capacity,
            }),
            None => Err(AllocError::OutOfMemory),
        }
    }

    /// Grants `amount` more bytes and returns the address of the first one,
    /// which is the old break. Fails without mutating anything when the
    /// reservation cannot cover the request.
    pub fn sbrk(&mut self, amount: usize) -> Result<NonNull<u8>, AllocError> {
        if amount > self.capacity - self.brk {
            return Err(AllocError::OutOfMemory);
        }

        let old_break = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk += amount;

        Ok(old_break)
    }

    /// Low bound of granted memory.
    pub fn lo(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// High bound of granted memory: the first address past the break.
    pub fn hi(&self) -> usize {
        self.lo() + self.brk
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { platform::release(self.base, self.capacity) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_are_contiguous() {
        let mut arena = Arena::reserve(4096).unwrap();
        let lo = arena.lo();

        let first = arena.sbrk(64).unwrap();
        let second = arena.sbrk(128).unwrap();
        let third = arena.sbrk(8).unwrap();

        assert_eq!(first.as_ptr() as usize, lo);
        assert_eq!(second.as_ptr() as usize, lo + 64);
        assert_eq!(third.as_ptr() as usize, lo + 192);
        assert_eq!(arena.hi(), lo + 200);
    }

    #[test]
    fn exhaustion_fails_without_mutation() {
        let mut arena = Arena::reserve(1).unwrap();
        let capacity = arena.capacity;

        arena.sbrk(capacity - 8).unwrap();
        let hi = arena.hi();

        assert_eq!(arena.sbrk(16), Err(AllocError::OutOfMemory));
        assert_eq!(arena.hi(), hi);

        // The remainder can still be granted afterwards.
        arena.sbrk(8).unwrap();
        assert_eq!(arena.hi(), arena.lo() + capacity);
    }

    #[test]
    fn capacity_rounds_up_to_pages() {
        let page = crate::platform::page_size();

        let arena = Arena::reserve(0).unwrap();
        assert_eq!(arena.capacity, page);

        let arena = Arena::reserve(page + 1).unwrap();
        assert_eq!(arena.capacity, 2 * page);
    }
}
