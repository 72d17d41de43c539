//! Arena storage and chunk addressing.
//!
//! The arena is the only memory the allocator touches. This module owns the
//! translation between [`ChunkIndex`] values and addresses inside the arena,
//! plus raw word access used by the header codec.

use core::{
    marker::PhantomData,
    ops::{Add, Sub},
    ptr::NonNull,
};

use snafu::{OptionExt as _, Snafu, ensure};

use crate::{ARENA_SIZE, CHUNK_SIZE, MAX_CHUNKS};

/// Backing storage for an arena.
///
/// The storage is aligned to [`CHUNK_SIZE`], so every chunk boundary is
/// chunk-aligned in memory as well. Place it in a `static` (optionally in a
/// dedicated linker section) or on the heap of a hosted program.
#[repr(C, align(32))]
pub struct ArenaStorage([u8; ARENA_SIZE]);
const _: () = assert!(align_of::<ArenaStorage>() == CHUNK_SIZE);
const _: () = assert!(size_of::<ArenaStorage>() == ARENA_SIZE);

impl Default for ArenaStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaStorage {
    /// Creates zero-filled storage.
    ///
    /// Being `const`, this lets the storage live in `.bss`.
    #[must_use]
    pub const fn new() -> Self {
        Self([0; ARENA_SIZE])
    }
}

/// Index of a chunk inside the arena, in `0..MAX_CHUNKS`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct ChunkIndex(u16);
const _: () = assert!(ChunkIndex::MAX.0 as usize == MAX_CHUNKS - 1);

impl ChunkIndex {
    /// The first chunk of the arena.
    pub const MIN: Self = Self(0);
    /// The last chunk of the arena.
    pub const MAX: Self = Self(1023);

    /// Creates a chunk index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not less than [`MAX_CHUNKS`].
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self::try_new(index).unwrap_or_else(|| panic!("chunk index out of range: {index}"))
    }

    /// Creates a chunk index, or returns `None` if `index` is past the end of
    /// the arena.
    #[must_use]
    pub fn try_new(index: usize) -> Option<Self> {
        if index >= MAX_CHUNKS {
            return None;
        }
        u16::try_from(index).ok().map(Self)
    }

    /// Returns the raw index value.
    #[must_use]
    pub fn value(self) -> usize {
        usize::from(self.0)
    }

    /// Returns the index `chunks` past this one, or `None` if that lies past
    /// the end of the arena.
    #[must_use]
    pub fn checked_add(self, chunks: usize) -> Option<Self> {
        Self::try_new(self.value().checked_add(chunks)?)
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        debug_assert!(bits < 1 << 10);
        Self::new(bits as usize)
    }

    pub(crate) fn bits(self) -> u32 {
        u32::from(self.0)
    }
}

impl Add<usize> for ChunkIndex {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self::new(self.value() + rhs)
    }
}

impl Sub<Self> for ChunkIndex {
    type Output = usize;

    fn sub(self, rhs: Self) -> Self::Output {
        self.value() - rhs.value()
    }
}

/// Errors returned when adopting raw memory as an arena.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArenaError {
    #[snafu(display("null arena pointer given"))]
    NullPointer,
    #[snafu(display("arena pointer is not chunk aligned: address={address:#x}"))]
    Unaligned { address: usize },
}

/// A borrowed arena of [`ARENA_SIZE`] bytes.
///
/// The arena only translates between chunk indices and addresses; it has no
/// notion of blocks. The lifetime ties it to the storage it was created from.
pub struct Arena<'a> {
    base: NonNull<u8>,
    _storage: PhantomData<&'a mut ArenaStorage>,
}

unsafe impl Send for Arena<'_> {}

impl<'a> Arena<'a> {
    /// Creates an arena over the given storage.
    pub fn new(storage: &'a mut ArenaStorage) -> Self {
        Self {
            base: NonNull::from(storage).cast(),
            _storage: PhantomData,
        }
    }

    /// Creates an arena over raw memory, such as a linker-placed region.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + ARENA_SIZE` is valid for reads and writes for `'a`
    /// - the region is not accessed by anything else while the arena lives,
    ///   except through payload pointers handed out by the allocator
    pub unsafe fn from_raw(base: *mut u8) -> Result<Self, ArenaError> {
        let base = NonNull::new(base).context(NullPointerSnafu)?;
        let address = base.as_ptr().addr();
        ensure!(address.is_multiple_of(CHUNK_SIZE), UnalignedSnafu { address });
        Ok(Self {
            base,
            _storage: PhantomData,
        })
    }

    /// Returns the first byte of the arena.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns `true` if `ptr` points inside the arena.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr().addr();
        (start..start + ARENA_SIZE).contains(&ptr.addr())
    }

    /// Returns the address of the first byte of `chunk`.
    #[must_use]
    pub fn address_of(&self, chunk: ChunkIndex) -> NonNull<u8> {
        unsafe { self.base.add(chunk.value() * CHUNK_SIZE) }
    }

    /// Returns the chunk starting at `addr`.
    ///
    /// `addr` must be a chunk-aligned address inside the arena; this is only
    /// checked in debug builds.
    #[must_use]
    pub fn chunk_index_of(&self, addr: NonNull<u8>) -> ChunkIndex {
        debug_assert!(self.contains(addr.as_ptr()), "address outside of arena: {addr:p}");
        let offset = addr.as_ptr().addr().wrapping_sub(self.base.as_ptr().addr());
        debug_assert!(offset.is_multiple_of(CHUNK_SIZE), "unaligned block address: {addr:p}");
        ChunkIndex::new(offset / CHUNK_SIZE)
    }

    pub(crate) fn read_word(&self, chunk: ChunkIndex, word: usize) -> u32 {
        debug_assert!(word < CHUNK_SIZE / size_of::<u32>());
        unsafe { self.address_of(chunk).cast::<u32>().add(word).read() }
    }

    pub(crate) fn write_word(&mut self, chunk: ChunkIndex, word: usize, value: u32) {
        debug_assert!(word < CHUNK_SIZE / size_of::<u32>());
        unsafe { self.address_of(chunk).cast::<u32>().add(word).write(value) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_index_range() {
        assert_eq!(ChunkIndex::try_new(0), Some(ChunkIndex::MIN));
        assert_eq!(ChunkIndex::try_new(1023), Some(ChunkIndex::MAX));
        assert_eq!(ChunkIndex::try_new(1024), None);
        assert_eq!(ChunkIndex::MAX.checked_add(1), None);
        assert_eq!(ChunkIndex::new(10).checked_add(5), Some(ChunkIndex::new(15)));
        assert_eq!(ChunkIndex::new(10) + 5, ChunkIndex::new(15));
        assert_eq!(ChunkIndex::new(15) - ChunkIndex::new(10), 5);
    }

    #[test]
    fn test_chunk_index_display() {
        assert_eq!(ChunkIndex::new(42).to_string(), "#42");
    }

    #[test]
    fn test_address_translation() {
        let mut storage = Box::new(ArenaStorage::new());
        let arena = Arena::new(&mut storage);
        let base = arena.base();

        assert_eq!(arena.address_of(ChunkIndex::MIN), base);
        let addr = arena.address_of(ChunkIndex::new(3));
        assert_eq!(addr.as_ptr().addr() - base.as_ptr().addr(), 3 * CHUNK_SIZE);
        assert_eq!(arena.chunk_index_of(addr), ChunkIndex::new(3));
        assert_eq!(
            arena.chunk_index_of(arena.address_of(ChunkIndex::MAX)),
            ChunkIndex::MAX
        );
    }

    #[test]
    fn test_contains() {
        let mut storage = Box::new(ArenaStorage::new());
        let arena = Arena::new(&mut storage);
        let base = arena.base().as_ptr();

        assert!(arena.contains(base));
        assert!(arena.contains(base.wrapping_add(ARENA_SIZE - 1)));
        assert!(!arena.contains(base.wrapping_add(ARENA_SIZE)));
        assert!(!arena.contains(base.wrapping_sub(1)));
    }

    #[test]
    fn test_word_access() {
        let mut storage = Box::new(ArenaStorage::new());
        let mut arena = Arena::new(&mut storage);

        arena.write_word(ChunkIndex::new(7), 0, 0xdead_beef);
        arena.write_word(ChunkIndex::new(7), 1, 0x1234_5678);
        assert_eq!(arena.read_word(ChunkIndex::new(7), 0), 0xdead_beef);
        assert_eq!(arena.read_word(ChunkIndex::new(7), 1), 0x1234_5678);
        assert_eq!(arena.read_word(ChunkIndex::new(8), 0), 0);
    }

    #[test]
    fn test_from_raw() {
        let mut storage = Box::new(ArenaStorage::new());
        let base = storage.0.as_mut_ptr();

        let arena = unsafe { Arena::from_raw(base) }.unwrap();
        assert_eq!(arena.base().as_ptr(), base);

        let err = unsafe { Arena::from_raw(base.wrapping_add(4)) }.err().unwrap();
        assert!(matches!(err, ArenaError::Unaligned { .. }));

        let err = unsafe { Arena::from_raw(core::ptr::null_mut()) }.err().unwrap();
        assert!(matches!(err, ArenaError::NullPointer));
    }
}
