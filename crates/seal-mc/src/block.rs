//! State block layout.
//!
//! A block is `[size: u16][flags: u16][extension][payload]`. The size field
//! covers the whole block; the extension is owned by the search algorithm and
//! never interpreted here; the payload is the canonical configuration.
//! Blocks are sealed once written: only the flags and the extension change
//! afterwards.

use crate::arena::{Arena, ArenaError, Slot};
use crate::hash::hash64;

/// Bytes taken by the size and flag fields.
pub const HEADER: usize = 4;

/// Largest block the 16-bit size field can describe.
pub const MAX_BLOCK: usize = u16::MAX as usize;

/// Header flag bits.
pub mod flags {
    /// Marked for deletion.
    pub const DELETED: u16 = 1 << 0;
    /// Successors have been generated.
    pub const SEEN: u16 = 1 << 1;
    /// On the DFS stack.
    pub const ON_STACK: u16 = 1 << 2;
}

/// Block geometry chosen by the active search algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    ext: usize,
}

impl Layout {
    pub const fn new(ext: usize) -> Self {
        Self { ext }
    }

    #[inline]
    pub fn ext_len(&self) -> usize {
        self.ext
    }

    /// Offset of the first payload byte.
    #[inline]
    pub fn payload_start(&self) -> usize {
        HEADER + self.ext
    }

    /// Total size of a block holding `payload_len` bytes.
    #[inline]
    pub fn block_size(&self, payload_len: usize) -> usize {
        HEADER + self.ext + payload_len
    }

    /// Allocate a block in `arena`, zero its header and extension, and copy
    /// the payload in.
    pub fn seal(&self, arena: &mut Arena, payload: &[u8]) -> Result<Slot, ArenaError> {
        let size = self.block_size(payload.len());
        if size > MAX_BLOCK {
            return Err(ArenaError::BlockTooLarge { size });
        }
        let slot = arena.allocate(size)?;
        let bytes = arena.get_mut(slot);
        bytes[0..2].copy_from_slice(&(size as u16).to_le_bytes());
        bytes[2..4].fill(0);
        bytes[HEADER..HEADER + self.ext].fill(0);
        bytes[HEADER + self.ext..size].copy_from_slice(payload);
        Ok(slot)
    }

    #[inline]
    pub fn payload<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[self.payload_start()..size(block)]
    }

    #[inline]
    pub fn ext<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[HEADER..HEADER + self.ext]
    }

    #[inline]
    pub fn ext_mut<'a>(&self, block: &'a mut [u8]) -> &'a mut [u8] {
        &mut block[HEADER..HEADER + self.ext]
    }
}

/// Block size as recorded in the header.
#[inline]
pub fn size(block: &[u8]) -> usize {
    u16::from_le_bytes([block[0], block[1]]) as usize
}

#[inline]
pub fn flags(block: &[u8]) -> u16 {
    u16::from_le_bytes([block[2], block[3]])
}

#[inline]
pub fn has_flag(block: &[u8], flag: u16) -> bool {
    flags(block) & flag != 0
}

#[inline]
pub fn set_flag(block: &mut [u8], flag: u16, on: bool) {
    let mut f = flags(block);
    if on {
        f |= flag;
    } else {
        f &= !flag;
    }
    block[2..4].copy_from_slice(&f.to_le_bytes());
}

/// Hashing and equality over the comparison range of a block.
///
/// The range starts `slack` bytes past the header, so an algorithm storing its
/// extension in front of the payload can keep it out of the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHasher {
    slack: usize,
    seed: u64,
}

impl BlockHasher {
    pub const fn new(slack: usize) -> Self {
        Self { slack, seed: 0 }
    }

    pub const fn with_seed(slack: usize, seed: u64) -> Self {
        Self { slack, seed }
    }

    /// The hasher matching a layout: the whole extension is slack.
    pub const fn for_layout(layout: Layout) -> Self {
        Self::new(layout.ext)
    }

    #[inline]
    pub fn key<'a>(&self, block: &'a [u8]) -> &'a [u8] {
        &block[HEADER + self.slack..size(block)]
    }

    /// Non-zero 64-bit hash of the comparison range.
    #[inline]
    pub fn hash(&self, block: &[u8]) -> u64 {
        self.hash_key(self.key(block))
    }

    /// Hash of a comparison range that is not inside a block (yet). With the
    /// hasher of a layout this is the block's payload.
    #[inline]
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        match hash64(key, self.seed) {
            0 => 1,
            h => h,
        }
    }

    #[inline]
    pub fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.key(a) == self.key(b)
    }
}
