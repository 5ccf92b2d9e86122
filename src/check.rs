use std::ptr::NonNull;

use derive_more::{Display, Error};

use crate::{
    block::{Block, MIN_BLOCK_SIZE, TAGS_SIZE, WORD_SIZE},
    freelist::FreeList,
    heap::Heap,
};

/// The rule a corrupted heap broke. Corruption is always a symptom of
/// caller misuse (double release, buffer overrun, foreign pointer); the
/// allocator itself never polices these at run time, it only diagnoses
/// them here after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Violation {
    /// A block reachable from the free list carries the allocated flag.
    #[display("allocated block is linked into the free list")]
    AllocatedBlockInFreeList,

    /// A free block's list successor is not free.
    #[display("free list successor is not free")]
    SuccessorNotFree,

    /// A free block's list predecessor is not free.
    #[display("free list predecessor is not free")]
    PredecessorNotFree,

    /// Two physically adjacent blocks are both free.
    #[display("physically adjacent block is free and was not coalesced")]
    UncoalescedNeighbor,

    /// The block at the arena's low bound is not the prologue.
    #[display("first block in the arena is not the prologue")]
    MisplacedPrologue,

    /// The block just below the arena's high bound is not the epilogue.
    #[display("block at the top of the arena is not the epilogue")]
    MisplacedEpilogue,

    /// A block's size is below the minimum or not aligned.
    #[display("block size is malformed")]
    MalformedSize,

    /// A block extends past the arena's current bounds.
    #[display("block extends past the arena bounds")]
    OutOfBounds,

    /// A block's header and footer disagree on size or allocated flag.
    #[display("header and footer tags disagree")]
    TagMismatch,

    /// A free block exists that the free list does not reach.
    #[display("free block is not reachable from the free list")]
    NotInFreeList,

    /// The free list holds more entries than there are free blocks.
    #[display("free list length does not match the number of free blocks")]
    FreeListMismatch,
}

/// Diagnostic produced by [`Heap::validate`]: where the damage was found,
/// how big that block claims to be and which rule it breaks. What to do
/// with it — abort, log, discard the heap — is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("heap corruption at {address:#x}: {violation} (block size {size})")]
pub struct Corruption {
    /// Address of the offending block's header.
    pub address: usize,
    /// Size recorded in the offending block's header.
    pub size: usize,
    /// The broken rule.
    pub violation: Violation,
}

unsafe fn report(block: NonNull<Block>, violation: Violation) -> Corruption {
    Corruption {
        address: block.as_ptr() as usize,
        size: Block::size_of(block),
        violation,
    }
}

impl Heap {
    /// Audits the whole heap against every structural invariant and
    /// reports the first violation found. Read-only and linear in the
    /// number of blocks; meant for tests and debugging, never for the
    /// allocation path.
    ///
    /// The audit runs in this order: the free list ring (every linked
    /// block free, its list neighbors free, its physical neighbors
    /// allocated), the two sentinels, then an address-order walk from
    /// prologue to epilogue checking bounds, sizes and tag agreement,
    /// and finally that the set of free blocks matches the ring.
    pub fn validate(&self) -> Result<(), Corruption> {
        unsafe {
            for block in self.free_blocks.iter_blocks() {
                if Block::is_allocated(block) {
                    return Err(report(block, Violation::AllocatedBlockInFreeList));
                }
                if Block::is_allocated(FreeList::next_free(block)) {
                    return Err(report(block, Violation::SuccessorNotFree));
                }
                if Block::is_allocated(FreeList::prev_free(block)) {
                    return Err(report(block, Violation::PredecessorNotFree));
                }
                if !Block::is_allocated(Block::next_of(block))
                    || !Block::is_allocated(Block::prev_of(block))
                {
                    return Err(report(block, Violation::UncoalescedNeighbor));
                }
            }

            let lo = self.arena.lo();
            let hi = self.arena.hi();

            if self.prologue.as_ptr() as usize != lo {
                return Err(report(self.prologue, Violation::MisplacedPrologue));
            }
            if self.epilogue.as_ptr() as usize != hi - TAGS_SIZE {
                return Err(report(self.epilogue, Violation::MisplacedEpilogue));
            }

            let mut free_blocks_seen = 0;
            let mut current = self.prologue;

            while current != self.epilogue {
                let address = current.as_ptr() as usize;
                let size = Block::size_of(current);

                // Only the sentinels may be smaller than an ordinary block.
                let min = if current == self.prologue {
                    TAGS_SIZE
                } else {
                    MIN_BLOCK_SIZE
                };
                if size < min || size % WORD_SIZE != 0 {
                    return Err(report(current, Violation::MalformedSize));
                }
                if address < lo || address + size > hi {
                    return Err(report(current, Violation::OutOfBounds));
                }
                if Block::header_tag_of(current) != Block::footer_tag_of(current) {
                    return Err(report(current, Violation::TagMismatch));
                }
                if !Block::is_allocated(current) {
                    free_blocks_seen += 1;
                }

                current = Block::next_of(current);
            }

            if Block::header_tag_of(self.epilogue) != Block::footer_tag_of(self.epilogue) {
                return Err(report(self.epilogue, Violation::TagMismatch));
            }

            if free_blocks_seen != self.free_blocks.len() {
                // Point at a free block the ring does not reach, if there
                // is one; otherwise the ring itself holds too much.
                let mut current = self.prologue;
                while current != self.epilogue {
                    if !Block::is_allocated(current)
                        && !self.free_blocks.iter_blocks().any(|b| b == current)
                    {
                        return Err(report(current, Violation::NotInFreeList));
                    }
                    current = Block::next_of(current);
                }

                return Err(Corruption {
                    address: lo,
                    size: self.free_blocks.len(),
                    violation: Violation::FreeListMismatch,
                });
            }
        }

        Ok(())
    }
}
