//! Half-fit memory allocator over a fixed, chunked arena.
//!
//! This crate manages a single statically sized byte region (the *arena*)
//! without any help from an operating system heap. It is `no_std`, performs
//! no allocation of its own, and keeps every piece of bookkeeping inside the
//! arena it manages.
//!
//! # Arena Layout
//!
//! The arena is [`ARENA_SIZE`] bytes split into [`MAX_CHUNKS`] chunks of
//! [`CHUNK_SIZE`] bytes. Every block starts on a chunk boundary and spans a
//! whole number of chunks. The first word of a block's first chunk is its
//! header; a free block additionally stores its free-list links in the second
//! word, where an allocated block's payload would begin.
//!
//! ```text
//! Allocated block:                     Free block:
//! ┌────────────┬──────────────────┐    ┌────────────┬────────────┬──────────┐
//! │ header (4) │ payload ...      │    │ header (4) │ links (4)  │ unused   │
//! └────────────┴──────────────────┘    └────────────┴────────────┴──────────┘
//!  prev:10 next:10 size-1:10 alloc:1    prev_free:10 next_free:10
//! ```
//!
//! # Algorithm
//!
//! Free blocks are filed into [`BUCKET_COUNT`] power-of-two size classes.
//! Class `i` holds free blocks of `2^i ..= 2^(i+1) - 1` chunks. An allocation
//! searches from the class of the requested chunk count upward and takes the
//! head of the first suitable class, so the granted block never exceeds twice
//! the request. The chosen block is split, and the remainder is filed back.
//! Freeing a block merges it with free address-order neighbors before filing
//! it.
//!
//! | Operation | Time | Overhead |
//! |-----------|------|----------|
//! | allocate  | O(classes) | 4 bytes/block + rounding to 32 bytes |
//! | deallocate | O(classes) | none |
//!
//! # Usage
//!
//! ```rust
//! use half_fit::{Arena, ArenaStorage, HalfFit};
//!
//! let mut storage = Box::new(ArenaStorage::new());
//! let mut heap = HalfFit::new(Arena::new(&mut storage));
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe {
//!     ptr.write_bytes(0xa5, 100);
//!     heap.deallocate(ptr);
//! }
//! assert!(heap.check().is_ok());
//! ```
//!
//! # Thread Safety
//!
//! [`HalfFit`] is `Send` but not `Sync`; every call must be serialized by the
//! caller. [`LockedHalfFit`] wraps it in a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc):
//!
//! ```rust,ignore
//! use half_fit::{ArenaStorage, LockedHalfFit};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedHalfFit = LockedHalfFit::new();
//!
//! #[unsafe(link_section = ".heap")]
//! static mut ARENA: ArenaStorage = ArenaStorage::new();
//!
//! fn main() {
//!     ALLOCATOR.init(unsafe { &mut *(&raw mut ARENA) });
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    arena::{Arena, ArenaError, ArenaStorage, ChunkIndex},
    bucket::bucket_index_for,
    error::AllocError,
    heap::{HalfFit, chunks_for},
    inspect::{BlockInfo, BlockState, Blocks, BucketInfo, HeapCheckError, HeapStats},
    locked::LockedHalfFit,
};

mod arena;
mod bucket;
mod error;
mod header;
mod heap;
mod inspect;
mod locked;

/// Size of one chunk, the allocation granularity, in bytes.
pub const CHUNK_SIZE: usize = 32;

/// Number of chunks in the arena.
pub const MAX_CHUNKS: usize = 1024;

/// Size of the arena in bytes.
pub const ARENA_SIZE: usize = CHUNK_SIZE * MAX_CHUNKS;

/// Number of size classes.
///
/// The last class holds only the block spanning the whole arena.
pub const BUCKET_COUNT: usize = 11;

/// Bytes reserved at the start of every block for its header.
pub const HEADER_SIZE: usize = 4;

/// Alignment of every payload pointer returned by the allocator.
pub const PAYLOAD_ALIGN: usize = HEADER_SIZE;

/// Largest request that can ever be satisfied, in bytes.
pub const MAX_REQUEST_SIZE: usize = ARENA_SIZE - HEADER_SIZE;

const _: () = assert!(ARENA_SIZE % CHUNK_SIZE == 0);
const _: () = assert!(1 << (BUCKET_COUNT - 1) == MAX_CHUNKS);
const _: () = assert!(MAX_CHUNKS <= 1 << 10, "links are packed into 10 bits");
const _: () = assert!(2 * HEADER_SIZE <= CHUNK_SIZE, "free links share the first chunk");
const _: () = assert!(CHUNK_SIZE % PAYLOAD_ALIGN == 0);
