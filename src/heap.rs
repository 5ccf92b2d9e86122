use std::ptr::{self, NonNull};

use crate::{
    align::align,
    arena::Arena,
    block::{Block, MIN_BLOCK_SIZE, TAGS_SIZE, WORD_SIZE},
    error::AllocError,
    freelist::FreeList,
    Pointer,
};

/// When the free list cannot satisfy a request the arena grows by at least
/// this much, so a burst of small allocations costs one growth instead of
/// one per call.
pub(crate) const CHUNK_SIZE: usize = 1024;

/// A fitting block is only split when the leftover is at least this large.
/// Smaller leftovers stay inside the allocated block as internal
/// fragmentation, trading a bounded amount of waste for fewer blocks.
pub(crate) const SPLIT_THRESHOLD: usize = 8 * MIN_BLOCK_SIZE;

/// One heap: one arena, its free list and its two sentinels. All allocator
/// state lives here, so independent heaps are just independent values.
///
/// The prologue and epilogue are ordinary blocks of minimal size that are
/// permanently allocated. Every real block therefore has an allocated
/// neighbor on the outside of the arena in both directions, which removes
/// every bounds special case from coalescing and traversal: a merge simply
/// stops at any allocated block.
///
/// ```text
/// lo                                                        hi
/// +----------+----------------------------------+----------+
/// | Prologue |         ordinary blocks          | Epilogue |
/// +----------+----------------------------------+----------+
///              ^ grows at this end only ------->
/// ```
///
/// No method synchronizes; share a heap across threads only behind your own
/// lock, or give each thread its own heap.
pub struct Heap {
    /// Growth collaborator. Owns the mapping.
    pub(crate) arena: Arena,
    /// Ring of all free blocks.
    pub(crate) free_blocks: FreeList,
    /// First block in the arena, permanently allocated.
    pub(crate) prologue: NonNull<Block>,
    /// Last block in the arena, permanently allocated. Moves up on growth.
    pub(crate) epilogue: NonNull<Block>,
}

// A heap owns its arena exclusively, so moving the whole value to another
// thread is fine. It is deliberately not Sync.
unsafe impl Send for Heap {}

impl Heap {
    /// Arena reservation used by [`Heap::with_default_capacity`].
    pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

    /// Builds a heap over a fresh arena able to grow up to `capacity` bytes
    /// (rounded up to whole pages). The arena starts with just the two
    /// sentinels planted; the first allocation triggers the first real
    /// growth.
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        let mut arena = Arena::reserve(capacity)?;
        let base = arena.sbrk(2 * TAGS_SIZE)?;

        unsafe {
            let prologue = base.cast::<Block>();
            Block::set_size_and_allocated(prologue, TAGS_SIZE, true);

            let epilogue = Block::next_of(prologue);
            Block::set_size_and_allocated(epilogue, TAGS_SIZE, true);

            Ok(Self {
                arena,
                free_blocks: FreeList::new(),
                prologue,
                epilogue,
            })
        }
    }

    /// Same as [`Heap::with_capacity`] with [`Heap::DEFAULT_CAPACITY`].
    pub fn with_default_capacity() -> Result<Self, AllocError> {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Allocates a block whose payload can hold at least `size` bytes and
    /// returns the payload address, aligned to the machine word. The
    /// payload may be larger than requested; `size == 0` is valid and
    /// yields a minimum sized block.
    ///
    /// The search is first-fit over the free list. When nothing fits the
    /// arena grows by at least [`CHUNK_SIZE`]; if it cannot, the heap is
    /// left untouched and the request fails.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let required = required_block_size(size)?;

        unsafe {
            let block = match self.find_free_block(required) {
                Some(block) => block,
                None => self.extend(required.max(CHUNK_SIZE))?,
            };

            if Block::size_of(block) - required >= SPLIT_THRESHOLD {
                self.split(block, required);
            } else {
                self.free_blocks.remove_block(block);
                Block::set_allocated(block, true);
            }

            Ok(Block::payload_of(block))
        }
    }

    /// Releases a block, making its payload available for reuse, and merges
    /// it with whichever physical neighbors are free so that no two
    /// adjacent free blocks remain.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`Heap::allocate`] or
    /// [`Heap::reallocate`] on this same heap, and the block must still be
    /// allocated. Releasing anything else, or releasing twice, corrupts
    /// the heap; only [`Heap::validate`] will notice, after the fact.
    pub unsafe fn release(&mut self, payload: NonNull<u8>) {
        let block = Block::from_payload(payload);
        debug_assert!(Block::is_allocated(block), "block released twice");

        Block::set_allocated(block, false);
        self.free_blocks.insert_block(block);
        self.coalesce(block);
    }

    /// Resizes an allocation, preserving the first `min(old size, size)`
    /// payload bytes.
    ///
    /// * `reallocate(None, size)` is exactly `allocate(size)`.
    /// * `reallocate(Some(p), 0)` is exactly `release(p)` and returns
    ///   `Ok(None)`.
    /// * If the block already has capacity for `size`, `p` is returned
    ///   unchanged; shrinking never splits.
    /// * Otherwise the block grows in place by absorbing a free successor,
    ///   or a free predecessor when that alone suffices (the payload moves
    ///   down to the predecessor's start), and as a last resort the
    ///   contents move to a freshly allocated block and the old one is
    ///   released.
    ///
    /// A pointer invalidated by a move must not be used again; the
    /// returned pointer replaces it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::release`] for `payload` when it is
    /// `Some`.
    pub unsafe fn reallocate(
        &mut self,
        payload: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(payload) = payload else {
            return self.allocate(size).map(Some);
        };

        if size == 0 {
            self.release(payload);
            return Ok(None);
        }

        let required = required_block_size(size)?;
        let block = Block::from_payload(payload);
        debug_assert!(Block::is_allocated(block), "reallocating a free block");

        if Block::size_of(block) >= required {
            return Ok(Some(payload));
        }

        // However the block grows below, this is how many payload bytes
        // exist right now and thus how many can survive.
        let old_payload_size = Block::payload_size_of(block);

        // Absorbing the successor costs nothing: the payload stays put.
        let next = Block::next_of(block);
        if !Block::is_allocated(next) {
            self.free_blocks.remove_block(next);
            Block::set_size(block, Block::size_of(block) + Block::size_of(next));

            if Block::size_of(block) >= required {
                return Ok(Some(payload));
            }
        }

        // Absorbing the predecessor moves the block's start down, so only
        // do it when it actually gets us to the required size; a merge
        // that still falls short would leave the caller's pointer no
        // longer matching the block's payload address.
        let prev = Block::prev_of(block);
        if !Block::is_allocated(prev)
            && Block::size_of(prev) + Block::size_of(block) >= required
        {
            self.free_blocks.remove_block(prev);
            Block::set_size_and_allocated(
                prev,
                Block::size_of(prev) + Block::size_of(block),
                true,
            );

            // The regions overlap, this must be a memmove.
            let destination = Block::payload_of(prev);
            ptr::copy(payload.as_ptr(), destination.as_ptr(), old_payload_size);
            return Ok(Some(destination));
        }

        // Still short. Move to a fresh block; the old contents are intact
        // at `payload` even if the successor was absorbed above.
        let new_payload = self.allocate(size)?;
        ptr::copy_nonoverlapping(
            payload.as_ptr(),
            new_payload.as_ptr(),
            old_payload_size.min(size),
        );
        self.release(payload);

        Ok(Some(new_payload))
    }

    /// First-fit scan of the free list ring, starting at the most recently
    /// freed block and wrapping once around.
    unsafe fn find_free_block(&self, size: usize) -> Pointer<Block> {
        self.free_blocks
            .iter_blocks()
            .find(|&block| Block::size_of(block) >= size)
    }

    /// Grows the arena and folds the new space into a free block of `size`
    /// bytes (rounded up to the minimum block size and the alignment
    /// unit), which is returned already inserted into the free list.
    ///
    /// The old epilogue slot becomes the new block's header and a fresh
    /// epilogue is planted at the new end of the arena, so the net cost of
    /// a growth is exactly `size` bytes:
    ///
    /// ```text
    /// before:  | ... | Epilogue |
    /// after:   | ... |       new free block       | Epilogue |
    /// ```
    ///
    /// If the arena refuses to grow, nothing is mutated.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<Block>, AllocError> {
        let size = align(size.max(MIN_BLOCK_SIZE));
        self.arena.sbrk(size)?;

        let block = self.epilogue;
        Block::set_size_and_allocated(block, size, false);
        self.free_blocks.insert_block(block);

        self.epilogue = Block::next_of(block);
        Block::set_size_and_allocated(self.epilogue, TAGS_SIZE, true);

        Ok(block)
    }

    /// Carves a free block in two: an allocated front of exactly `size`
    /// bytes and a free remainder that goes back into the list.
    ///
    /// ```text
    /// before:  |            Free            |
    /// after:   | Allocated |      Free      |
    /// ```
    unsafe fn split(&mut self, block: NonNull<Block>, size: usize) {
        let total = Block::size_of(block);
        debug_assert!(
            total - size >= MIN_BLOCK_SIZE,
            "remainder cannot hold its own tags and links"
        );

        self.free_blocks.remove_block(block);
        Block::set_size_and_allocated(block, size, true);

        let remainder = Block::next_of(block);
        Block::set_size_and_allocated(remainder, total - size, false);
        self.free_blocks.insert_block(remainder);
    }

    /// Merges a free block with whichever physical neighbors are free and
    /// returns the surviving block. Merging only ever runs right to left,
    /// absorbing a block into the one before it, so the survivor's address
    /// is the lowest address involved. The sentinels are permanently
    /// allocated and therefore never absorbed.
    unsafe fn coalesce(&mut self, mut block: NonNull<Block>) -> NonNull<Block> {
        let next = Block::next_of(block);
        let prev = Block::prev_of(block);

        self.free_blocks.remove_block(block);

        if !Block::is_allocated(next) {
            self.free_blocks.remove_block(next);
            Block::set_size(block, Block::size_of(block) + Block::size_of(next));
        }

        if !Block::is_allocated(prev) {
            self.free_blocks.remove_block(prev);
            Block::set_size(prev, Block::size_of(prev) + Block::size_of(block));
            block = prev;
        }

        self.free_blocks.insert_block(block);

        block
    }
}

/// Block size needed to serve a payload of `size` bytes: the payload is
/// raised to the minimum block size so that it can always host the free
/// list links later, aligned, and topped with the two tags. No allocation
/// can exceed `isize::MAX` bytes; rejecting those requests here also keeps
/// every size computation downstream overflow free.
fn required_block_size(size: usize) -> Result<usize, AllocError> {
    let effective = size.max(MIN_BLOCK_SIZE);

    if effective > isize::MAX as usize - TAGS_SIZE - WORD_SIZE {
        return Err(AllocError::InvalidRequest);
    }

    Ok(align(effective) + TAGS_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Big enough that no test below ever exhausts it by accident.
    fn heap() -> Heap {
        Heap::with_capacity(64 * 1024).unwrap()
    }

    unsafe fn fill(payload: NonNull<u8>, len: usize) {
        for i in 0..len {
            *payload.as_ptr().add(i) = (i % 251) as u8;
        }
    }

    unsafe fn assert_filled(payload: NonNull<u8>, len: usize) {
        for i in 0..len {
            assert_eq!(*payload.as_ptr().add(i), (i % 251) as u8, "byte {i}");
        }
    }

    #[test]
    fn freshly_initialized_heap() {
        let heap = heap();

        unsafe {
            assert_eq!(heap.prologue.as_ptr() as usize, heap.arena.lo());
            assert_eq!(Block::size_of(heap.prologue), TAGS_SIZE);
            assert_eq!(Block::size_of(heap.epilogue), TAGS_SIZE);
            assert_eq!(heap.epilogue, Block::next_of(heap.prologue));
        }

        assert_eq!(heap.free_blocks.len(), 0);
        assert_eq!(heap.arena.hi() - heap.arena.lo(), 2 * TAGS_SIZE);
        heap.validate().unwrap();
    }

    #[test]
    fn allocate_write_read() {
        let mut heap = heap();

        let p = heap.allocate(16).unwrap();
        assert_eq!(p.as_ptr() as usize % WORD_SIZE, 0);

        unsafe {
            assert!(Block::payload_size_of(Block::from_payload(p)) >= 16);
            fill(p, 16);
            assert_filled(p, 16);
        }

        heap.validate().unwrap();
    }

    #[test]
    fn first_allocation_grows_by_one_chunk() {
        let mut heap = heap();
        let lo = heap.arena.lo();

        heap.allocate(16).unwrap();

        // One chunk was granted on top of the sentinels and the leftover
        // was split off as a free block.
        assert_eq!(heap.arena.hi() - lo, 2 * TAGS_SIZE + CHUNK_SIZE);
        assert_eq!(heap.free_blocks.len(), 1);

        unsafe {
            let leftover = heap.free_blocks.first_block().unwrap();
            assert_eq!(
                Block::size_of(leftover),
                CHUNK_SIZE - required_block_size(16).unwrap()
            );
        }

        heap.validate().unwrap();
    }

    #[test]
    fn released_block_is_reachable_from_the_free_list() {
        let mut heap = heap();

        let p = heap.allocate(16).unwrap();
        let block = unsafe { Block::from_payload(p) };

        unsafe { heap.release(p) };
        heap.validate().unwrap();

        // The block merged with the chunk leftover, so the list holds one
        // free block spanning the whole chunk, starting where p's block
        // started.
        assert_eq!(heap.free_blocks.len(), 1);
        assert_eq!(heap.free_blocks.first_block(), Some(block));
        unsafe {
            assert_eq!(Block::size_of(block), CHUNK_SIZE);
        }
    }

    #[test]
    fn release_leaves_other_allocations_untouched() {
        let mut heap = heap();

        let p1 = heap.allocate(100).unwrap();
        let p2 = heap.allocate(100).unwrap();
        unsafe { fill(p2, 100) };

        unsafe { heap.release(p1) };

        heap.validate().unwrap();
        unsafe { assert_filled(p2, 100) };
    }

    #[test]
    fn release_coalesces_both_neighbors() {
        let mut heap = heap();

        let p1 = heap.allocate(100).unwrap();
        let p2 = heap.allocate(100).unwrap();
        let p3 = heap.allocate(100).unwrap();

        unsafe {
            heap.release(p1);
            heap.release(p3);
            heap.validate().unwrap();

            // p1 alone, p3 merged with the chunk leftover.
            assert_eq!(heap.free_blocks.len(), 2);

            // Releasing p2 fuses everything back into one chunk-sized block.
            heap.release(p2);
        }

        heap.validate().unwrap();
        assert_eq!(heap.free_blocks.len(), 1);
        unsafe {
            let all = heap.free_blocks.first_block().unwrap();
            assert_eq!(Block::size_of(all), CHUNK_SIZE);
        }
    }

    #[test]
    fn oversized_request_grows_the_arena() {
        let mut heap = heap();

        heap.allocate(16).unwrap();
        let hi_before = heap.arena.hi();

        // Exceeds both the largest free block and the default chunk.
        let p = heap.allocate(5000).unwrap();

        assert!(heap.arena.hi() > hi_before);
        unsafe {
            assert!(Block::payload_size_of(Block::from_payload(p)) >= 5000);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn freed_region_is_reused_without_growth() {
        let mut heap = heap();

        let p = heap.allocate(5000).unwrap();
        unsafe { heap.release(p) };

        let hi_before = heap.arena.hi();
        let q = heap.allocate(4000).unwrap();

        // First fit lands on the freed region; the arena did not move.
        assert_eq!(q, p);
        assert_eq!(heap.arena.hi(), hi_before);
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_within_capacity_is_a_no_op() {
        let mut heap = heap();

        let p = heap.allocate(100).unwrap();
        unsafe {
            assert_eq!(heap.reallocate(Some(p), 100).unwrap(), Some(p));
            assert_eq!(heap.reallocate(Some(p), 50).unwrap(), Some(p));
            assert_eq!(heap.reallocate(Some(p), 1).unwrap(), Some(p));
        }
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_grows_in_place_over_free_successor() {
        let mut heap = heap();

        let p = heap.allocate(100).unwrap();
        unsafe {
            fill(p, 100);

            // The chunk leftover sits right after p's block, so growth is
            // in place and the contents are never copied.
            let q = heap.reallocate(Some(p), 500).unwrap().unwrap();
            assert_eq!(q, p);
            assert_filled(q, 100);
            assert!(Block::payload_size_of(Block::from_payload(q)) >= 500);
        }

        heap.validate().unwrap();
        assert_eq!(heap.free_blocks.len(), 0);
    }

    #[test]
    fn reallocate_merges_free_predecessor_and_moves_payload_down() {
        let mut heap = heap();

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        // Consume the rest of the chunk so b's successor is allocated.
        let c = heap.allocate(768).unwrap();

        unsafe {
            heap.release(a);
            fill(b, 100);

            let q = heap.reallocate(Some(b), 180).unwrap().unwrap();

            // The block slid down into a's old spot.
            assert_eq!(q, a);
            assert_filled(q, 100);
            assert!(Block::payload_size_of(Block::from_payload(q)) >= 180);

            heap.validate().unwrap();
            assert_eq!(heap.free_blocks.len(), 0);

            heap.release(q);
            heap.release(c);
        }

        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_relocates_when_neighbors_cannot_help() {
        let mut heap = heap();

        let p1 = heap.allocate(16).unwrap();
        let p2 = heap.allocate(16).unwrap();

        unsafe {
            fill(p1, 16);

            // p1 is pinned between the prologue and p2, so this must move.
            let q = heap.reallocate(Some(p1), 2000).unwrap().unwrap();
            assert_ne!(q, p1);
            assert_filled(q, 16);
            assert!(Block::payload_size_of(Block::from_payload(q)) >= 2000);

            heap.validate().unwrap();

            heap.release(q);
            heap.release(p2);
        }

        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_null_is_allocate() {
        let mut heap = heap();

        let p = unsafe { heap.reallocate(None, 64) }.unwrap().unwrap();
        unsafe {
            assert!(Block::payload_size_of(Block::from_payload(p)) >= 64);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_to_zero_is_release() {
        let mut heap = heap();

        let p = heap.allocate(64).unwrap();
        let result = unsafe { heap.reallocate(Some(p), 0) }.unwrap();

        assert_eq!(result, None);
        assert_eq!(heap.free_blocks.len(), 1);
        heap.validate().unwrap();
    }

    #[test]
    fn zero_sized_allocation_is_valid() {
        let mut heap = heap();

        let p = heap.allocate(0).unwrap();
        heap.validate().unwrap();

        unsafe {
            assert!(Block::payload_size_of(Block::from_payload(p)) >= MIN_BLOCK_SIZE);
            heap.release(p);
        }

        heap.validate().unwrap();
    }

    #[test]
    fn exhausted_arena_fails_cleanly() {
        // One page of arena: the sentinels fit, a huge request does not.
        let mut heap = Heap::with_capacity(1).unwrap();

        assert_eq!(heap.allocate(100_000), Err(AllocError::OutOfMemory));

        // Nothing was mutated and the heap keeps working.
        assert_eq!(heap.free_blocks.len(), 0);
        heap.validate().unwrap();

        let p = heap.allocate(100).unwrap();
        unsafe {
            fill(p, 100);
            assert_filled(p, 100);
        }
        heap.validate().unwrap();
    }

    #[test]
    fn overflowing_request_is_rejected() {
        let mut heap = heap();

        assert_eq!(heap.allocate(usize::MAX), Err(AllocError::InvalidRequest));
        assert_eq!(
            heap.allocate(usize::MAX - MIN_BLOCK_SIZE),
            Err(AllocError::InvalidRequest)
        );
        heap.validate().unwrap();
    }

    #[test]
    fn validate_passes_across_a_mixed_workload() {
        let mut heap = heap();
        let mut live = Vec::new();

        unsafe {
            for size in [0, 1, 16, 100, 512, 2000, 31, 64] {
                live.push((heap.allocate(size).unwrap(), size));
                heap.validate().unwrap();
            }

            // Release every other allocation.
            for (p, _) in live.iter().copied().skip(1).step_by(2) {
                heap.release(p);
                heap.validate().unwrap();
            }
            let mut live: Vec<_> = live.into_iter().step_by(2).collect();

            // Grow and shrink the survivors.
            for (p, size) in live.iter_mut() {
                *p = heap.reallocate(Some(*p), *size * 2 + 8).unwrap().unwrap();
                heap.validate().unwrap();
            }

            for (p, _) in live {
                heap.release(p);
                heap.validate().unwrap();
            }
        }

        // Everything coalesced back into a handful of free spans.
        assert!(heap.free_blocks.len() >= 1);
    }
}
