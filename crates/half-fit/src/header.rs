//! Block header codec.
//!
//! Every block keeps a 32-bit header in the first word of its first chunk.
//! Free blocks additionally keep their free-list links in the second word.
//! That word belongs to the payload while the block is allocated, so it is
//! only decoded when the header says the block is free.
//!
//! Links are stored as 10-bit chunk indices. A link that refers to the block
//! itself means "no such block": no block is ever its own neighbor, so the
//! self-link is never a valid link and chunk 0 stays usable as a target.

use bitflags::bitflags;

use crate::{
    MAX_CHUNKS,
    arena::{Arena, ChunkIndex},
};

bitflags! {
    /// Flag bits of a block header word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HeaderFlags: u32 {
        /// Set while the block is handed out to a caller.
        const ALLOCATED = 1 << 30;
    }
}

const LINK_MASK: u32 = (1 << 10) - 1;
const PREV_SHIFT: u32 = 0;
const NEXT_SHIFT: u32 = 10;
const SIZE_SHIFT: u32 = 20;
const FLAGS_MASK: u32 = !((1 << 30) - 1);

const PREV_FREE_SHIFT: u32 = 0;
const NEXT_FREE_SHIFT: u32 = 10;

const HEADER_WORD: usize = 0;
const FREE_LINKS_WORD: usize = 1;

const _: () = assert!(LINK_MASK.count_ones() == 10);
const _: () = assert!(MAX_CHUNKS - 1 <= LINK_MASK as usize);
const _: () = assert!(HeaderFlags::all().bits() & !FLAGS_MASK == 0);

/// Address-order links and size of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockLinks {
    /// Length of the block in chunks, in `1..=MAX_CHUNKS`.
    pub(crate) size: usize,
    /// Block immediately before this one.
    pub(crate) prev: Option<ChunkIndex>,
    /// Block immediately after this one.
    pub(crate) next: Option<ChunkIndex>,
}

/// Links of a free block within its size-class list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeLinks {
    pub(crate) prev_free: Option<ChunkIndex>,
    pub(crate) next_free: Option<ChunkIndex>,
}

/// Decoded header of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub(crate) enum BlockHeader {
    Allocated(BlockLinks),
    Free(BlockLinks, FreeLinks),
}

impl BlockHeader {
    pub(crate) fn links(&self) -> &BlockLinks {
        match self {
            Self::Allocated(links) | Self::Free(links, _) => links,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.links().size
    }
}

fn encode_link(owner: ChunkIndex, link: Option<ChunkIndex>) -> u32 {
    debug_assert_ne!(link, Some(owner), "block {owner} linked to itself");
    link.unwrap_or(owner).bits()
}

fn decode_link(owner: ChunkIndex, bits: u32) -> Option<ChunkIndex> {
    let link = ChunkIndex::from_bits(bits & LINK_MASK);
    (link != owner).then_some(link)
}

fn encode_header(owner: ChunkIndex, links: &BlockLinks, flags: HeaderFlags) -> u32 {
    debug_assert!(
        (1..=MAX_CHUNKS).contains(&links.size),
        "invalid block size: {}",
        links.size
    );
    #[expect(clippy::cast_possible_truncation)]
    let size_bits = (links.size - 1) as u32;
    (encode_link(owner, links.prev) << PREV_SHIFT)
        | (encode_link(owner, links.next) << NEXT_SHIFT)
        | (size_bits << SIZE_SHIFT)
        | flags.bits()
}

fn decode_header(owner: ChunkIndex, word: u32) -> (BlockLinks, HeaderFlags) {
    let links = BlockLinks {
        size: ((word >> SIZE_SHIFT) & LINK_MASK) as usize + 1,
        prev: decode_link(owner, word >> PREV_SHIFT),
        next: decode_link(owner, word >> NEXT_SHIFT),
    };
    (links, HeaderFlags::from_bits_retain(word & FLAGS_MASK))
}

fn encode_free_links(owner: ChunkIndex, links: FreeLinks) -> u32 {
    (encode_link(owner, links.prev_free) << PREV_FREE_SHIFT)
        | (encode_link(owner, links.next_free) << NEXT_FREE_SHIFT)
}

fn decode_free_links(owner: ChunkIndex, word: u32) -> FreeLinks {
    FreeLinks {
        prev_free: decode_link(owner, word >> PREV_FREE_SHIFT),
        next_free: decode_link(owner, word >> NEXT_FREE_SHIFT),
    }
}

impl Arena<'_> {
    /// Decodes the header of the block starting at `chunk`.
    pub(crate) fn read_header(&self, chunk: ChunkIndex) -> BlockHeader {
        let (links, flags) = decode_header(chunk, self.read_word(chunk, HEADER_WORD));
        if flags.contains(HeaderFlags::ALLOCATED) {
            BlockHeader::Allocated(links)
        } else {
            BlockHeader::Free(links, self.read_free_links(chunk))
        }
    }

    /// Encodes `header` into the block starting at `chunk`.
    ///
    /// Writing an allocated header leaves the payload untouched.
    pub(crate) fn write_header(&mut self, chunk: ChunkIndex, header: &BlockHeader) {
        match header {
            BlockHeader::Allocated(links) => {
                let word = encode_header(chunk, links, HeaderFlags::ALLOCATED);
                self.write_word(chunk, HEADER_WORD, word);
            }
            BlockHeader::Free(links, free_links) => {
                let word = encode_header(chunk, links, HeaderFlags::empty());
                self.write_word(chunk, HEADER_WORD, word);
                self.write_free_links(chunk, *free_links);
            }
        }
    }

    /// Decodes only the address-order part of the header.
    pub(crate) fn read_links(&self, chunk: ChunkIndex) -> BlockLinks {
        decode_header(chunk, self.read_word(chunk, HEADER_WORD)).0
    }

    /// Rewrites the `prev` link of a block, keeping every other field.
    pub(crate) fn set_prev(&mut self, chunk: ChunkIndex, prev: Option<ChunkIndex>) {
        let (mut links, flags) = decode_header(chunk, self.read_word(chunk, HEADER_WORD));
        links.prev = prev;
        self.write_word(chunk, HEADER_WORD, encode_header(chunk, &links, flags));
    }

    /// Reads the free-list links of a free block.
    pub(crate) fn read_free_links(&self, chunk: ChunkIndex) -> FreeLinks {
        decode_free_links(chunk, self.read_word(chunk, FREE_LINKS_WORD))
    }

    /// Writes the free-list links of a free block.
    pub(crate) fn write_free_links(&mut self, chunk: ChunkIndex, links: FreeLinks) {
        self.write_word(chunk, FREE_LINKS_WORD, encode_free_links(chunk, links));
    }
}
