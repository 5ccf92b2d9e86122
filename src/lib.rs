//! Boundary-tag heap allocator with an explicit free list.
//!
//! The allocator manages a single contiguous arena that only ever grows.
//! Every block in the arena starts with a header tag and ends with a footer
//! tag, each one machine word encoding the block's size and its allocated
//! bit, so the arena can be walked in both address directions. Free blocks
//! additionally lend the first two words of their payload to a circular
//! doubly linked free list. Two permanently allocated sentinel blocks, the
//! prologue and the epilogue, bound the arena so that coalescing and
//! traversal never need to special-case the ends:
//!
//! ```text
//! lo                                                              hi
//! +----------+--------+--------------+--------+--------+----------+
//! | Prologue | Block  |     Free     | Block  |  Free  | Epilogue |
//! +----------+--------+--------------+--------+--------+----------+
//!                            ^                     ^
//!                            |                     |
//!                            +-- free list ring ---+
//! ```
//!
//! Allocation is first-fit over the free list; when nothing fits, the arena
//! grows at the high end and the old epilogue slot becomes the start of a
//! new free block. Released blocks are merged with free physical neighbors
//! immediately, so no two adjacent blocks are ever both free.
//!
//! The whole allocator is a single [`Heap`] value. It is not synchronized;
//! wrap it yourself if you need to share it, or give each thread its own
//! heap.
//!
//! # Examples
//!
//! ```rust
//! use tagalloc::Heap;
//!
//! let mut heap = Heap::with_capacity(64 * 1024).unwrap();
//!
//! let p = heap.allocate(16).unwrap();
//! unsafe {
//!     p.as_ptr().write_bytes(0xab, 16);
//!     heap.release(p);
//! }
//!
//! assert!(heap.validate().is_ok());
//! ```

use std::ptr::NonNull;

mod align;
mod arena;
mod block;
mod check;
mod error;
mod freelist;
mod heap;
mod platform;

/// Non-null pointer to `T`. We use this in most places instead of `*mut T`
/// so the compiler forces us to deal with the `None` case explicitly.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use check::{Corruption, Violation};
pub use error::AllocError;
pub use heap::Heap;
