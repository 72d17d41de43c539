//! The half-fit allocator.

use core::ptr::NonNull;

use log::{debug, trace, warn};
use snafu::OptionExt as _;

use crate::{
    BUCKET_COUNT, CHUNK_SIZE, HEADER_SIZE, MAX_CHUNKS,
    arena::{Arena, ChunkIndex},
    bucket::{Buckets, bucket_index_for},
    error::{AllocError, OutOfMemorySnafu, RequestTooLargeSnafu},
    header::{BlockHeader, BlockLinks, FreeLinks},
};

/// Returns the number of chunks a request of `size` bytes occupies, header
/// included, or `None` if it does not fit in the arena at all.
///
/// # Examples
///
/// ```
/// use half_fit::chunks_for;
///
/// assert_eq!(chunks_for(0), Some(1));
/// assert_eq!(chunks_for(28), Some(1));
/// assert_eq!(chunks_for(29), Some(2));
/// assert_eq!(chunks_for(32 * 1024 - 4), Some(1024));
/// assert_eq!(chunks_for(32 * 1024 - 3), None);
/// ```
#[must_use]
pub fn chunks_for(size: usize) -> Option<usize> {
    let chunks = size.checked_add(HEADER_SIZE)?.div_ceil(CHUNK_SIZE);
    (chunks <= MAX_CHUNKS).then_some(chunks)
}

/// A half-fit allocator managing one arena.
///
/// # Algorithm
///
/// - **Allocation**: computes the chunk count of the request, takes a block
///   from the smallest suitable size class, and splits off the unused tail as
///   a new free block.
/// - **Deallocation**: marks the block free, absorbs free neighbors on either
///   side, and files the merged block under its size class.
///
/// Both run in time bounded by the number of size classes.
///
/// # Thread Safety
///
/// The allocator is `Send` but not `Sync`. Callers that share it between
/// execution contexts must serialize every call, e.g. with
/// [`LockedHalfFit`](crate::LockedHalfFit).
pub struct HalfFit<'a> {
    pub(crate) arena: Arena<'a>,
    pub(crate) buckets: Buckets,
}

impl<'a> HalfFit<'a> {
    /// Creates an allocator over `arena` and formats it as a single free
    /// block.
    ///
    /// Whatever the arena held before is discarded.
    #[must_use]
    pub fn new(arena: Arena<'a>) -> Self {
        let mut this = Self {
            arena,
            buckets: Buckets::new(),
        };
        this.init();
        this
    }

    /// Formats the arena as one free block spanning all chunks.
    ///
    /// Every outstanding allocation is invalidated; the caller must not use
    /// any pointer handed out before this call.
    pub fn init(&mut self) {
        self.buckets = Buckets::new();
        self.insert_free(
            ChunkIndex::MIN,
            BlockLinks {
                size: MAX_CHUNKS,
                prev: None,
                next: None,
            },
        );
        debug!("arena formatted: {MAX_CHUNKS} free chunks");
    }

    /// Returns the arena managed by this allocator.
    #[must_use]
    pub fn arena(&self) -> &Arena<'a> {
        &self.arena
    }

    /// Allocates at least `size` bytes.
    ///
    /// Returns `None` if the request is too large for the arena or no free
    /// block can hold it; the allocator is unchanged in both cases. See
    /// [`try_allocate`](Self::try_allocate) for the reason.
    ///
    /// The returned pointer is aligned to [`PAYLOAD_ALIGN`](crate::PAYLOAD_ALIGN)
    /// and valid for `size` bytes until it is passed to
    /// [`deallocate`](Self::deallocate).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok()
    }

    /// Allocates at least `size` bytes, reporting why a request failed.
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = self.allocate_block(size);
        match result {
            Ok(ptr) => trace!("alloc({size}) -> {ptr:p}"),
            Err(err) => warn!("alloc({size}) failed: {err}"),
        }
        result
    }

    fn allocate_block(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let needed = chunks_for(size).context(RequestTooLargeSnafu { size })?;
        let (index, block) = self
            .buckets
            .find_fit(&self.arena, needed)
            .context(OutOfMemorySnafu {
                size,
                needed_chunks: needed,
            })?;

        let popped = self.buckets.pop_head(&mut self.arena, index);
        debug_assert_eq!(popped, Some(block));

        let links = self.arena.read_links(block);
        if links.size == needed {
            self.arena.write_header(block, &BlockHeader::Allocated(links));
        } else {
            self.split(block, links, needed);
        }
        Ok(self.payload_of(block))
    }

    /// Turns the first `needed` chunks of the free block `block` into an
    /// allocated block and files the rest as a new free block.
    fn split(&mut self, block: ChunkIndex, links: BlockLinks, needed: usize) {
        debug_assert!(needed < links.size);
        let remainder = block + needed;
        let remainder_links = BlockLinks {
            size: links.size - needed,
            prev: Some(block),
            next: links.next,
        };

        self.arena.write_header(
            block,
            &BlockHeader::Allocated(BlockLinks {
                size: needed,
                prev: links.prev,
                next: Some(remainder),
            }),
        );
        if let Some(next) = links.next {
            // The old neighbor of a free block is always allocated, so the
            // remainder never needs merging.
            self.arena.set_prev(next, Some(remainder));
        }
        self.insert_free(remainder, remainder_links);
        debug!(
            "split {block}: {} chunks -> {needed} allocated + {} free at {remainder}",
            links.size, remainder_links.size
        );
    }

    /// Releases a block returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this allocator since the last
    ///   [`init`](Self::init)
    /// - `ptr` has not been deallocated before
    /// - the payload is not accessed after this call
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = self.block_of(ptr);
        let header = self.arena.read_header(block);
        debug_assert!(
            header.is_allocated(),
            "double free or foreign pointer: {ptr:p}"
        );
        trace!("free({ptr:p}): {block}, {} chunks", header.size());

        let mut links = *header.links();
        if links.size == MAX_CHUNKS {
            self.init();
            return;
        }

        let start = self.coalesce(block, &mut links);
        if let Some(next) = links.next {
            self.arena.set_prev(next, Some(start));
        }
        self.insert_free(start, links);
    }

    /// Absorbs free neighbors of the block at `block` until none is left.
    ///
    /// On return `links` describes the merged block, which starts at the
    /// returned chunk. Absorbed neighbors are removed from their buckets.
    fn coalesce(&mut self, block: ChunkIndex, links: &mut BlockLinks) -> ChunkIndex {
        let mut start = block;
        loop {
            let mut merged = false;

            if let Some((prev, prev_links)) = self.free_neighbor(links.prev) {
                self.buckets.remove(&mut self.arena, prev);
                debug!("merge {prev} ({} chunks) <- {start}", prev_links.size);
                start = prev;
                links.size += prev_links.size;
                links.prev = prev_links.prev;
                merged = true;
            }

            if let Some((next, next_links)) = self.free_neighbor(links.next) {
                self.buckets.remove(&mut self.arena, next);
                debug!("merge {start} -> {next} ({} chunks)", next_links.size);
                links.size += next_links.size;
                links.next = next_links.next;
                merged = true;
            }

            if !merged {
                return start;
            }
        }
    }

    fn free_neighbor(&self, neighbor: Option<ChunkIndex>) -> Option<(ChunkIndex, BlockLinks)> {
        let neighbor = neighbor?;
        match self.arena.read_header(neighbor) {
            BlockHeader::Free(links, _) => Some((neighbor, links)),
            BlockHeader::Allocated(_) => None,
        }
    }

    /// Returns the number of bytes usable through `ptr`.
    ///
    /// This is at least the size requested when `ptr` was allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this allocator.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.block_of(ptr);
        self.arena.read_links(block).size * CHUNK_SIZE - HEADER_SIZE
    }

    fn insert_free(&mut self, start: ChunkIndex, links: BlockLinks) {
        self.arena
            .write_header(start, &BlockHeader::Free(links, FreeLinks::default()));
        let index = bucket_index_for(links.size);
        debug_assert!(index < BUCKET_COUNT);
        self.buckets.push(&mut self.arena, index, start);
    }

    fn payload_of(&self, block: ChunkIndex) -> NonNull<u8> {
        unsafe { self.arena.address_of(block).add(HEADER_SIZE) }
    }

    fn block_of(&self, ptr: NonNull<u8>) -> ChunkIndex {
        debug_assert!(
            self.arena.contains(ptr.as_ptr()),
            "pointer outside of arena: {ptr:p}"
        );
        self.arena.chunk_index_of(unsafe { ptr.sub(HEADER_SIZE) })
    }
}
