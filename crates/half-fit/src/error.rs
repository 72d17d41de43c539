use snafu::Snafu;

use crate::MAX_REQUEST_SIZE;

/// Reasons an allocation request can fail.
///
/// A failed request leaves the allocator untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    /// The request exceeds the largest block the arena can hold.
    #[snafu(display(
        "request too large: size={size}, max_request_size={max}",
        max = MAX_REQUEST_SIZE
    ))]
    RequestTooLarge { size: usize },
    /// No free block in any size class is large enough.
    #[snafu(display("out of memory: size={size}, needed_chunks={needed_chunks}"))]
    OutOfMemory { size: usize, needed_chunks: usize },
}
