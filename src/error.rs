use derive_more::{Display, Error};

/// Failure of an allocation, reallocation or heap construction. None of the
/// operations returning this mutate the heap on the error path, so a failed
/// request leaves every block and the free list exactly as they were.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum AllocError {
    /// The requested size cannot be laid out as a block because rounding it
    /// up to the alignment unit and adding the boundary-tag overhead
    /// overflows. This is the closest a `usize` API gets to a negative
    /// size request.
    #[display("requested size cannot be laid out as a block")]
    InvalidRequest,

    /// The arena cannot grow any further, either because the platform
    /// refused to hand out the initial reservation or because the
    /// reservation is exhausted.
    #[display("arena is exhausted")]
    OutOfMemory,
}
