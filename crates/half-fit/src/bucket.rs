//! Size-class free lists.
//!
//! Free blocks are filed into [`BUCKET_COUNT`] classes by
//! [`bucket_index_for`]. Each class is a doubly linked list threaded through
//! the free blocks themselves (see [`FreeLinks`]); the allocator only keeps
//! the list heads and an occupancy bitmap.

use log::trace;

use crate::{
    BUCKET_COUNT,
    arena::{Arena, ChunkIndex},
    header::FreeLinks,
};

/// Returns the size class of a block of `size_chunks` chunks.
///
/// This is `floor(log2(size_chunks))`, clamped to the last class.
///
/// # Panics
///
/// Panics if `size_chunks` is zero.
///
/// # Examples
///
/// ```
/// use half_fit::bucket_index_for;
///
/// assert_eq!(bucket_index_for(1), 0);
/// assert_eq!(bucket_index_for(7), 2);
/// assert_eq!(bucket_index_for(8), 3);
/// assert_eq!(bucket_index_for(1024), 10);
/// ```
#[must_use]
pub fn bucket_index_for(size_chunks: usize) -> usize {
    assert!(size_chunks > 0, "block size must be at least one chunk");
    (size_chunks.ilog2() as usize).min(BUCKET_COUNT - 1)
}

/// Heads of the per-class free lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Buckets {
    /// Bit `i` is set iff class `i` has at least one free block.
    occupancy: u16,
    heads: [Option<ChunkIndex>; BUCKET_COUNT],
}
const _: () = assert!(BUCKET_COUNT <= u16::BITS as usize);

impl Default for Buckets {
    fn default() -> Self {
        Self::new()
    }
}

impl Buckets {
    pub(crate) const fn new() -> Self {
        Self {
            occupancy: 0,
            heads: [None; BUCKET_COUNT],
        }
    }

    pub(crate) fn is_occupied(&self, index: usize) -> bool {
        self.occupancy & (1 << index) != 0
    }

    pub(crate) fn head(&self, index: usize) -> Option<ChunkIndex> {
        self.heads[index]
    }

    fn set_head(&mut self, index: usize, head: Option<ChunkIndex>) {
        self.heads[index] = head;
        if head.is_some() {
            self.occupancy |= 1 << index;
        } else {
            self.occupancy &= !(1 << index);
        }
    }

    /// Inserts the free block `block` at the head of class `index`.
    ///
    /// The block's header must already describe it as free.
    pub(crate) fn push(&mut self, arena: &mut Arena<'_>, index: usize, block: ChunkIndex) {
        debug_assert!(arena.read_header(block).is_free(), "pushing allocated block {block}");
        debug_assert_eq!(bucket_index_for(arena.read_links(block).size), index);

        let old_head = self.heads[index];
        arena.write_free_links(
            block,
            FreeLinks {
                prev_free: None,
                next_free: old_head,
            },
        );
        if let Some(old_head) = old_head {
            let mut links = arena.read_free_links(old_head);
            links.prev_free = Some(block);
            arena.write_free_links(old_head, links);
        }
        self.set_head(index, Some(block));
        trace!("bucket {index}: push {block}");
    }

    /// Removes and returns the head of class `index`.
    pub(crate) fn pop_head(&mut self, arena: &mut Arena<'_>, index: usize) -> Option<ChunkIndex> {
        let head = self.heads[index]?;
        let next = arena.read_free_links(head).next_free;
        if let Some(next) = next {
            let mut links = arena.read_free_links(next);
            links.prev_free = None;
            arena.write_free_links(next, links);
        }
        self.set_head(index, next);
        trace!("bucket {index}: pop {head}");
        Some(head)
    }

    /// Unlinks the free block `block` from whichever class holds it.
    pub(crate) fn remove(&mut self, arena: &mut Arena<'_>, block: ChunkIndex) {
        let header = arena.read_header(block);
        debug_assert!(header.is_free(), "removing allocated block {block}");
        let index = bucket_index_for(header.size());
        let links = arena.read_free_links(block);

        match links.prev_free {
            Some(prev) => {
                let mut prev_links = arena.read_free_links(prev);
                prev_links.next_free = links.next_free;
                arena.write_free_links(prev, prev_links);
            }
            None => {
                debug_assert_eq!(self.heads[index], Some(block));
                self.set_head(index, links.next_free);
            }
        }
        if let Some(next) = links.next_free {
            let mut next_links = arena.read_free_links(next);
            next_links.prev_free = links.prev_free;
            arena.write_free_links(next, next_links);
        }
        trace!("bucket {index}: remove {block}");
    }

    /// Finds a free block of at least `needed_chunks` chunks.
    ///
    /// The search starts at the class of `needed_chunks` and only moves toward
    /// larger classes. Blocks in the starting class may be smaller than the
    /// request, so only its head is considered there; every block of a higher
    /// class is large enough. Returns the class and the block, which is always
    /// the head of that class.
    pub(crate) fn find_fit(
        &self,
        arena: &Arena<'_>,
        needed_chunks: usize,
    ) -> Option<(usize, ChunkIndex)> {
        let first = bucket_index_for(needed_chunks);
        let first_head = self.heads[first]
            .filter(|&head| arena.read_links(head).size >= needed_chunks);
        if let Some(head) = first_head {
            return Some((first, head));
        }
        (first + 1..BUCKET_COUNT)
            .find(|&index| self.is_occupied(index))
            .and_then(|index| Some((index, self.heads[index]?)))
    }
}
