use std::{mem, ptr::NonNull};

use crate::freelist::FreeListNode;

/// Alignment unit of the arena. Block sizes are multiples of this, block
/// addresses are aligned to it, and since the payload sits exactly one tag
/// past the block address, payload pointers are aligned to it as well.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Size of a single boundary tag in bytes.
pub(crate) const TAG_SIZE: usize = WORD_SIZE;

/// Overhead of one block: header tag plus footer tag.
pub(crate) const TAGS_SIZE: usize = 2 * TAG_SIZE;

/// Minimum size of any block. A free block stores its two free list links
/// in the payload, so the payload must never be smaller than a
/// [`FreeListNode`]. Both tags and both links are word sized, so this is
/// already a multiple of [`WORD_SIZE`].
pub(crate) const MIN_BLOCK_SIZE: usize = TAGS_SIZE + mem::size_of::<FreeListNode>();

/// Block sizes are multiples of [`WORD_SIZE`], which leaves the low bits of
/// a tag word unused. The lowest one stores the allocated flag.
const ALLOCATED_BIT: usize = 1;

/// Masks the size out of a tag word, discarding the flag bits.
const SIZE_MASK: usize = !(WORD_SIZE - 1);

/// A block is a contiguous byte range bracketed by two identical boundary
/// tags. Each tag is one word holding the block size with the allocated
/// flag packed into the lowest bit:
///
/// ```text
/// block                                                   block + size
///   |                                                          |
///   v                                                          v
///   +-------------+------------------------------+-------------+
///   | size | a    |           Payload            | size | a    |
///   +-------------+------------------------------+-------------+
///     header tag                                    footer tag
/// ```
///
/// The footer exists so that the block physically preceding any block can
/// be found by reading one word backwards, without any global index. The
/// payload belongs to the caller while the block is allocated; while it is
/// free, its first two words are reinterpreted as the free list links (see
/// [`crate::freelist`]).
///
/// This struct is only the header word. All accessors are associated
/// functions taking [`NonNull<Block>`] instead of methods on `&self`, so we
/// never materialize references into arena memory that the caller also has
/// pointers into. See
/// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
#[repr(transparent)]
pub(crate) struct Block {
    /// Header tag word. The footer is addressed relative to this.
    tag: usize,
}

impl Block {
    /// Total block size in bytes, including both tags.
    ///
    /// # Safety
    ///
    /// `block` must point at the header tag of an initialized block.
    #[inline]
    pub unsafe fn size_of(block: NonNull<Block>) -> usize {
        (*block.as_ptr()).tag & SIZE_MASK
    }

    /// Payload capacity in bytes, which is everything between the tags.
    #[inline]
    pub unsafe fn payload_size_of(block: NonNull<Block>) -> usize {
        Self::size_of(block) - TAGS_SIZE
    }

    /// Whether the block is currently allocated.
    #[inline]
    pub unsafe fn is_allocated(block: NonNull<Block>) -> bool {
        (*block.as_ptr()).tag & ALLOCATED_BIT != 0
    }

    /// Writes both tags in one go. Header first, then the footer at the
    /// position the new size dictates, so a caller never observes a footer
    /// belonging to a stale size.
    ///
    /// # Safety
    ///
    /// The whole range `block..block + size` must be inside memory granted
    /// by the arena.
    pub unsafe fn set_size_and_allocated(block: NonNull<Block>, size: usize, allocated: bool) {
        debug_assert!(size >= TAGS_SIZE, "block cannot even hold its own tags");
        debug_assert!(size % WORD_SIZE == 0, "block size must be aligned");

        let tag = size | usize::from(allocated);
        (*block.as_ptr()).tag = tag;
        *Self::footer_of(block) = tag;
    }

    /// Resizes the block, keeping its allocated flag.
    #[inline]
    pub unsafe fn set_size(block: NonNull<Block>, size: usize) {
        Self::set_size_and_allocated(block, size, Self::is_allocated(block));
    }

    /// Flips the allocated flag on both tags, keeping the size.
    #[inline]
    pub unsafe fn set_allocated(block: NonNull<Block>, allocated: bool) {
        Self::set_size_and_allocated(block, Self::size_of(block), allocated);
    }

    /// First payload byte, right after the header tag.
    #[inline]
    pub unsafe fn payload_of(block: NonNull<Block>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(TAG_SIZE))
    }

    /// Recovers the block from a payload pointer previously produced by
    /// [`Self::payload_of`].
    ///
    /// # Safety
    ///
    /// `payload` must be a payload pointer handed out by this allocator.
    /// Anything else reads a tag out of arbitrary bytes.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Block> {
        NonNull::new_unchecked(payload.as_ptr().sub(TAG_SIZE).cast())
    }

    /// Block physically following this one: `block + size`. Only valid if
    /// a block actually exists there, which the epilogue sentinel
    /// guarantees for every block before it.
    #[inline]
    pub unsafe fn next_of(block: NonNull<Block>) -> NonNull<Block> {
        NonNull::new_unchecked(
            block
                .as_ptr()
                .cast::<u8>()
                .add(Self::size_of(block))
                .cast(),
        )
    }

    /// Block physically preceding this one, found by reading the footer
    /// tag that ends one word before our header. Only valid if a block
    /// exists there, which the prologue sentinel guarantees for every
    /// block after it.
    #[inline]
    pub unsafe fn prev_of(block: NonNull<Block>) -> NonNull<Block> {
        let preceding_footer = *block.as_ptr().cast::<usize>().sub(1);
        NonNull::new_unchecked(
            block
                .as_ptr()
                .cast::<u8>()
                .sub(preceding_footer & SIZE_MASK)
                .cast(),
        )
    }

    /// Raw header tag word, for the validator's header/footer comparison.
    #[inline]
    pub unsafe fn header_tag_of(block: NonNull<Block>) -> usize {
        (*block.as_ptr()).tag
    }

    /// Raw footer tag word. The footer is located using the header's size,
    /// so on a corrupted block this may read somewhere unexpected; that is
    /// exactly what the validator wants to detect.
    #[inline]
    pub unsafe fn footer_tag_of(block: NonNull<Block>) -> usize {
        *Self::footer_of(block)
    }

    /// Address of the footer tag word.
    #[inline]
    unsafe fn footer_of(block: NonNull<Block>) -> *mut usize {
        block
            .as_ptr()
            .cast::<u8>()
            .add(Self::size_of(block) - TAG_SIZE)
            .cast()
    }
}
