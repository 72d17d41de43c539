//! Read-only views of the allocator state.
//!
//! Nothing here mutates the arena. [`HalfFit::check`] walks both linked
//! structures and reports the first broken invariant, which makes it the
//! workhorse of the test suites and of the trace replay tool.

use snafu::{Snafu, ensure};

use crate::{
    BUCKET_COUNT, MAX_CHUNKS,
    arena::ChunkIndex,
    bucket::bucket_index_for,
    header::BlockHeader,
    heap::HalfFit,
};

/// Whether a block is handed out or available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant, derive_more::Display)]
pub enum BlockState {
    #[display("allocated")]
    Allocated,
    #[display("free")]
    Free,
}

/// A block of the address-ordered chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// First chunk of the block.
    pub start: ChunkIndex,
    /// Length in chunks.
    pub size: usize,
    pub state: BlockState,
}

/// State of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInfo {
    /// Size class; holds free blocks of `2^index ..= 2^(index+1) - 1` chunks.
    pub index: usize,
    pub occupied: bool,
    /// First block of the free list.
    pub head: Option<ChunkIndex>,
    /// Size of the first block, in chunks.
    pub head_size: Option<usize>,
    /// Number of blocks in the free list.
    pub len: usize,
}

/// Summary counters of an allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub free_chunks: usize,
    pub allocated_chunks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    /// Size of the largest free block in chunks, or 0 if none.
    pub largest_free: usize,
}

/// An invariant violation found by [`HalfFit::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum HeapCheckError {
    #[snafu(display("block chain does not terminate within the arena"))]
    UnterminatedChain,
    #[snafu(display("block {block} is linked from {actual:?}, expected {expected:?}"))]
    BrokenBackLink {
        block: ChunkIndex,
        expected: Option<ChunkIndex>,
        actual: Option<ChunkIndex>,
    },
    #[snafu(display("block {block} of {size} chunks is followed by {next:?}"))]
    NonContiguous {
        block: ChunkIndex,
        size: usize,
        next: Option<ChunkIndex>,
    },
    #[snafu(display("blocks cover {covered} chunks, expected {MAX_CHUNKS}"))]
    BrokenCoverage { covered: usize },
    #[snafu(display("adjacent free blocks {left} and {right} are not merged"))]
    Uncoalesced { left: ChunkIndex, right: ChunkIndex },
    #[snafu(display("bucket {bucket} occupancy flag disagrees with its head {head:?}"))]
    OccupancyMismatch {
        bucket: usize,
        head: Option<ChunkIndex>,
    },
    #[snafu(display("allocated block {block} is listed in bucket {bucket}"))]
    AllocatedInBucket { block: ChunkIndex, bucket: usize },
    #[snafu(display("free block {block} of {size} chunks is listed in bucket {bucket}"))]
    Misclassified {
        block: ChunkIndex,
        size: usize,
        bucket: usize,
    },
    #[snafu(display("block {block} in bucket {bucket} has a broken back link"))]
    BrokenFreeLink { block: ChunkIndex, bucket: usize },
    #[snafu(display("buckets list {listed} blocks, but the arena has {free_blocks} free blocks"))]
    FreeListMismatch { listed: usize, free_blocks: usize },
}

/// Iterator over the address-ordered block chain, created by
/// [`HalfFit::blocks`].
pub struct Blocks<'h, 'a> {
    heap: &'h HalfFit<'a>,
    next: Option<ChunkIndex>,
    remaining: usize,
}

impl Iterator for Blocks<'_, '_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        // A corrupted chain must not loop forever.
        self.remaining = self.remaining.checked_sub(1)?;
        let start = self.next?;
        let header = self.heap.arena.read_header(start);
        self.next = header.links().next;
        let state = match header {
            BlockHeader::Allocated(_) => BlockState::Allocated,
            BlockHeader::Free(..) => BlockState::Free,
        };
        Some(BlockInfo {
            start,
            size: header.size(),
            state,
        })
    }
}

impl<'a> HalfFit<'a> {
    /// Returns an iterator over all blocks in address order.
    ///
    /// # Examples
    ///
    /// ```
    /// use half_fit::{Arena, ArenaStorage, BlockState, HalfFit};
    ///
    /// let mut storage = Box::new(ArenaStorage::new());
    /// let mut heap = HalfFit::new(Arena::new(&mut storage));
    /// let _ptr = heap.allocate(100).unwrap();
    ///
    /// let states: Vec<_> = heap.blocks().map(|b| (b.size, b.state)).collect();
    /// assert_eq!(states, [(4, BlockState::Allocated), (1020, BlockState::Free)]);
    /// ```
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, 'a> {
        Blocks {
            heap: self,
            next: Some(ChunkIndex::MIN),
            remaining: MAX_CHUNKS,
        }
    }

    /// Returns the state of every size class, smallest class first.
    pub fn buckets(&self) -> impl Iterator<Item = BucketInfo> + '_ {
        (0..BUCKET_COUNT).map(|index| {
            let head = self.buckets.head(index);
            BucketInfo {
                index,
                occupied: self.buckets.is_occupied(index),
                head,
                head_size: head.map(|head| self.arena.read_links(head).size),
                len: self.free_list(index).count(),
            }
        })
    }

    /// Returns summary counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.blocks().fold(HeapStats::default(), |mut stats, block| {
            match block.state {
                BlockState::Allocated => {
                    stats.allocated_chunks += block.size;
                    stats.allocated_blocks += 1;
                }
                BlockState::Free => {
                    stats.free_chunks += block.size;
                    stats.free_blocks += 1;
                    stats.largest_free = stats.largest_free.max(block.size);
                }
            }
            stats
        })
    }

    /// Verifies every structural invariant of the allocator.
    ///
    /// - the block chain covers the arena contiguously and its back links
    ///   are consistent
    /// - no two free blocks are adjacent
    /// - every free block is listed exactly once, in the bucket of its size
    /// - bucket occupancy flags match the list heads
    pub fn check(&self) -> Result<(), HeapCheckError> {
        let free_blocks = self.check_chain()?;
        let mut listed = 0;
        for bucket in 0..BUCKET_COUNT {
            listed += self.check_bucket(bucket)?;
        }
        ensure!(
            listed == free_blocks,
            FreeListMismatchSnafu {
                listed,
                free_blocks
            }
        );
        Ok(())
    }

    fn check_chain(&self) -> Result<usize, HeapCheckError> {
        let mut expected_start = 0;
        let mut prev: Option<(ChunkIndex, bool)> = None;
        let mut free_blocks = 0;
        let mut visited = 0;
        let mut current = Some(ChunkIndex::MIN);

        while let Some(block) = current {
            ensure!(visited < MAX_CHUNKS, UnterminatedChainSnafu);
            visited += 1;
            let header = self.arena.read_header(block);
            let links = header.links();

            let expected_prev = prev.map(|(prev, _)| prev);
            ensure!(
                links.prev == expected_prev,
                BrokenBackLinkSnafu {
                    block,
                    expected: expected_prev,
                    actual: links.prev,
                }
            );
            ensure!(
                block.value() == expected_start,
                BrokenCoverageSnafu {
                    covered: expected_start
                }
            );

            let is_free = header.is_free();
            if is_free {
                if let Some((left, true)) = prev {
                    return UncoalescedSnafu { left, right: block }.fail();
                }
                free_blocks += 1;
            }

            expected_start += links.size;
            let contiguous = match links.next {
                Some(next) => next.value() == expected_start,
                None => expected_start == MAX_CHUNKS,
            };
            ensure!(
                contiguous,
                NonContiguousSnafu {
                    block,
                    size: links.size,
                    next: links.next,
                }
            );

            prev = Some((block, is_free));
            current = links.next;
        }
        ensure!(
            expected_start == MAX_CHUNKS,
            BrokenCoverageSnafu {
                covered: expected_start
            }
        );
        Ok(free_blocks)
    }

    fn check_bucket(&self, bucket: usize) -> Result<usize, HeapCheckError> {
        let head = self.buckets.head(bucket);
        ensure!(
            self.buckets.is_occupied(bucket) == head.is_some(),
            OccupancyMismatchSnafu { bucket, head }
        );

        let mut len = 0;
        let mut prev_free = None;
        let mut current = head;
        while let Some(block) = current {
            ensure!(len < MAX_CHUNKS, UnterminatedChainSnafu);
            let BlockHeader::Free(links, free_links) = self.arena.read_header(block) else {
                return AllocatedInBucketSnafu { block, bucket }.fail();
            };
            ensure!(
                bucket_index_for(links.size) == bucket,
                MisclassifiedSnafu {
                    block,
                    size: links.size,
                    bucket,
                }
            );
            ensure!(
                free_links.prev_free == prev_free,
                BrokenFreeLinkSnafu { block, bucket }
            );
            len += 1;
            prev_free = Some(block);
            current = free_links.next_free;
        }
        Ok(len)
    }

    fn free_list(&self, bucket: usize) -> impl Iterator<Item = ChunkIndex> + '_ {
        let mut current = self.buckets.head(bucket);
        core::iter::from_fn(move || {
            let block = current?;
            current = self.arena.read_free_links(block).next_free;
            Some(block)
        })
        .take(MAX_CHUNKS)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;
    use crate::arena::{Arena, ArenaStorage};

    fn with_test_heap<F>(test_fn: F)
    where
        F: FnOnce(&mut HalfFit<'_>),
    {
        let mut storage = Box::new(ArenaStorage::new());
        let mut heap = HalfFit::new(Arena::new(&mut storage));
        test_fn(&mut heap);
    }

    #[test]
    fn test_stats() {
        with_test_heap(|heap| {
            assert_eq!(
                heap.stats(),
                HeapStats {
                    free_chunks: MAX_CHUNKS,
                    allocated_chunks: 0,
                    free_blocks: 1,
                    allocated_blocks: 0,
                    largest_free: MAX_CHUNKS,
                }
            );

            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(100).unwrap();
            unsafe { heap.deallocate(a) };
            assert_eq!(
                heap.stats(),
                HeapStats {
                    free_chunks: MAX_CHUNKS - 4,
                    allocated_chunks: 4,
                    free_blocks: 2,
                    allocated_blocks: 1,
                    largest_free: MAX_CHUNKS - 8,
                }
            );
        });
    }

    #[test]
    fn test_buckets() {
        with_test_heap(|heap| {
            let buckets: Vec<_> = heap.buckets().collect();
            assert_eq!(buckets.len(), BUCKET_COUNT);
            assert_eq!(
                buckets[10],
                BucketInfo {
                    index: 10,
                    occupied: true,
                    head: Some(ChunkIndex::MIN),
                    head_size: Some(MAX_CHUNKS),
                    len: 1,
                }
            );
            assert!(buckets[..10].iter().all(|b| !b.occupied && b.len == 0));

            let a = heap.allocate(60).unwrap();
            let _b = heap.allocate(60).unwrap();
            let c = heap.allocate(60).unwrap();
            let _d = heap.allocate(60).unwrap();
            unsafe {
                heap.deallocate(a);
                heap.deallocate(c);
            }
            let bucket1 = heap.buckets().nth(1).unwrap();
            assert_eq!(bucket1.len, 2);
            assert_eq!(bucket1.head, Some(ChunkIndex::new(4)));
            assert_eq!(bucket1.head_size, Some(2));
        });
    }

    #[test]
    fn test_check_accepts_valid_states() {
        with_test_heap(|heap| {
            heap.check().unwrap();
            let ptrs: Vec<_> = (0..20).map(|i| heap.allocate(i * 37).unwrap()).collect();
            heap.check().unwrap();
            for ptr in ptrs.into_iter().step_by(2) {
                unsafe { heap.deallocate(ptr) };
                heap.check().unwrap();
            }
        });
    }

    #[test]
    fn test_check_accepts_arena_of_single_chunk_blocks() {
        with_test_heap(|heap| {
            let ptrs: Vec<_> = core::iter::from_fn(|| heap.allocate(0)).collect();
            assert_eq!(ptrs.len(), MAX_CHUNKS);
            assert_eq!(heap.blocks().count(), MAX_CHUNKS);
            heap.check().unwrap();

            for ptr in ptrs.iter().step_by(2) {
                unsafe { heap.deallocate(*ptr) };
            }
            heap.check().unwrap();
            assert_eq!(heap.stats().free_blocks, MAX_CHUNKS / 2);
        });
    }

    #[test]
    fn test_check_detects_broken_back_link() {
        with_test_heap(|heap| {
            let _a = heap.allocate(100).unwrap();
            heap.arena.set_prev(ChunkIndex::new(4), None);
            assert_eq!(
                heap.check(),
                Err(HeapCheckError::BrokenBackLink {
                    block: ChunkIndex::new(4),
                    expected: Some(ChunkIndex::MIN),
                    actual: None,
                })
            );
        });
    }

    #[test]
    fn test_check_detects_missing_free_block() {
        with_test_heap(|heap| {
            let _a = heap.allocate(100).unwrap();
            let popped = heap.buckets.pop_head(&mut heap.arena, 9);
            assert_eq!(popped, Some(ChunkIndex::new(4)));
            assert_eq!(
                heap.check(),
                Err(HeapCheckError::FreeListMismatch {
                    listed: 0,
                    free_blocks: 1,
                })
            );
        });
    }
}
