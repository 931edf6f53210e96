//! Size-classed slab allocator backing every state block.
//!
//! Allocations are rounded up to [`GRANULE`] bytes and served from the size
//! class of the rounded size. Each class owns a list of backing blocks, a bump
//! position in the block that is currently open and a free list of released
//! slots. The size of an allocation is never stored next to it: callers hand
//! the same size back on [`Arena::release`], and the block a slot lives in
//! knows the item width of its class.
//!
//! Handles are plain indices ([`Slot`]), so an arena is an ordinary owned
//! value: one per worker, never shared. A block that has to cross a worker
//! boundary leaves through [`Arena::transfer_out`] and is adopted on the other
//! side by [`Arena::transfer_in`] without another copy.

use std::fmt;
use thiserror::Error;

/// Allocation granularity in bytes. Every size class is a multiple of this.
pub const GRANULE: usize = 4;

/// Bytes in the first backing block opened for a class.
const INITIAL_BLOCK_BYTES: usize = 4 * 1024;

/// Backing blocks grow geometrically up to this many bytes.
const MAX_BLOCK_BYTES: usize = 1024 * 1024;

/// Resource exhaustion in the arena.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena exhausted: {requested} more bytes would exceed the {limit} byte ceiling")]
    Exhausted { requested: usize, limit: usize },

    #[error("state block of {size} bytes does not fit the 16-bit size field")]
    BlockTooLarge { size: usize },
}

/// Index-based handle to an allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Slot {
    block: u32,
    index: u32,
}

impl Slot {
    /// Pack the handle into a single integer (stable for the arena's lifetime).
    #[inline]
    pub fn as_u64(self) -> u64 {
        ((self.block as u64) << 32) | self.index as u64
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({}:{})", self.block, self.index)
    }
}

/// An allocation detached from its arena, on its way to another worker.
///
/// Owns exactly the class-rounded bytes of the allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Transfer {
    data: Box<[u8]>,
}

impl Transfer {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transfer({} bytes)", self.data.len())
    }
}

/// One backing block. `item` is the byte width of its class.
struct Block {
    data: Box<[u8]>,
    item: usize,
    /// Items handed out by bumping (adopted blocks start full).
    bumped: usize,
    /// Adopted from another arena: holds exactly one item.
    adopted: bool,
}

impl Block {
    fn capacity(&self) -> usize {
        if self.item == 0 {
            0
        } else {
            self.data.len() / self.item
        }
    }
}

#[derive(Default)]
struct Class {
    /// Block currently being bump-allocated from.
    open: Option<u32>,
    /// Items to put into the next backing block.
    next_items: usize,
    free: Vec<Slot>,
}

/// Counters describing an arena's footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes held by backing blocks (including adopted ones).
    pub reserved_bytes: usize,
    /// Allocations currently live.
    pub live: usize,
    /// Backing blocks opened or adopted.
    pub blocks: usize,
}

/// A per-worker slab allocator.
pub struct Arena {
    classes: Vec<Class>,
    blocks: Vec<Block>,
    reserved: usize,
    live: usize,
    /// Ceiling on reserved bytes (0 = unlimited).
    limit: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// Create an arena that refuses to reserve more than `limit` bytes (0 = unlimited).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            classes: Vec::new(),
            blocks: Vec::new(),
            reserved: 0,
            live: 0,
            limit,
        }
    }

    /// Round `size` up to its class width.
    #[inline]
    pub fn rounded(size: usize) -> usize {
        size.max(1).div_ceil(GRANULE) * GRANULE
    }

    #[inline]
    fn class_of(size: usize) -> usize {
        Self::rounded(size) / GRANULE
    }

    fn class_mut(&mut self, class: usize) -> &mut Class {
        if self.classes.len() <= class {
            self.classes.resize_with(class + 1, Class::default);
        }
        &mut self.classes[class]
    }

    /// Allocate `size` bytes. The returned slot reads as zeroes only if it was
    /// never used before; recycled slots keep their old contents.
    pub fn allocate(&mut self, size: usize) -> Result<Slot, ArenaError> {
        let class = Self::class_of(size);
        let item = class * GRANULE;

        if let Some(slot) = self.class_mut(class).free.pop() {
            self.live += 1;
            return Ok(slot);
        }

        if let Some(open) = self.classes[class].open {
            let block = &mut self.blocks[open as usize];
            if block.bumped < block.capacity() {
                let index = block.bumped as u32;
                block.bumped += 1;
                self.live += 1;
                return Ok(Slot { block: open, index });
            }
        }

        let block = self.open_block(class, item)?;
        let b = &mut self.blocks[block as usize];
        b.bumped = 1;
        self.live += 1;
        Ok(Slot { block, index: 0 })
    }

    fn open_block(&mut self, class: usize, item: usize) -> Result<u32, ArenaError> {
        let max_items = (MAX_BLOCK_BYTES / item).max(1);
        let items = {
            let c = self.class_mut(class);
            if c.next_items == 0 {
                c.next_items = (INITIAL_BLOCK_BYTES / item).max(1);
            }
            let items = c.next_items.min(max_items);
            c.next_items = (items * 2).min(max_items);
            items
        };
        let bytes = items * item;
        self.reserve(bytes)?;

        let id = self.blocks.len() as u32;
        self.blocks.push(Block {
            data: vec![0u8; bytes].into_boxed_slice(),
            item,
            bumped: 0,
            adopted: false,
        });
        self.classes[class].open = Some(id);
        Ok(id)
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), ArenaError> {
        if self.limit > 0 && self.reserved + bytes > self.limit {
            return Err(ArenaError::Exhausted {
                requested: bytes,
                limit: self.limit,
            });
        }
        self.reserved += bytes;
        Ok(())
    }

    /// Return a slot to the free list of the class for `size`.
    pub fn release(&mut self, slot: Slot, size: usize) {
        let class = Self::class_of(size);
        debug_assert_eq!(
            self.blocks[slot.block as usize].item,
            class * GRANULE,
            "slot released into the wrong size class"
        );
        self.class_mut(class).free.push(slot);
        self.live -= 1;
    }

    /// Bytes of an allocation, rounded up to its class width.
    #[inline]
    pub fn get(&self, slot: Slot) -> &[u8] {
        let block = &self.blocks[slot.block as usize];
        let start = slot.index as usize * block.item;
        &block.data[start..start + block.item]
    }

    #[inline]
    pub fn get_mut(&mut self, slot: Slot) -> &mut [u8] {
        let block = &mut self.blocks[slot.block as usize];
        let start = slot.index as usize * block.item;
        &mut block.data[start..start + block.item]
    }

    /// Detach an allocation so another arena can adopt it.
    ///
    /// Slots that were themselves adopted are handed on without copying; slab
    /// slots are copied out once and released.
    pub fn transfer_out(&mut self, slot: Slot, size: usize) -> Transfer {
        let block = &mut self.blocks[slot.block as usize];
        if block.adopted && !block.data.is_empty() {
            let data = std::mem::take(&mut block.data);
            self.reserved -= data.len();
            self.live -= 1;
            return Transfer { data };
        }
        let data: Box<[u8]> = self.get(slot).into();
        self.release(slot, size);
        Transfer { data }
    }

    /// Adopt a transferred allocation. The bytes are not copied; the slot
    /// belongs to the class of the transfer's length from now on.
    pub fn transfer_in(&mut self, transfer: Transfer) -> Slot {
        let item = transfer.data.len();
        let id = self.blocks.len() as u32;
        self.reserved += item;
        self.blocks.push(Block {
            data: transfer.data,
            item,
            bumped: 1,
            adopted: true,
        });
        self.live += 1;
        Slot { block: id, index: 0 }
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reserved_bytes: self.reserved,
            live: self.live,
            blocks: self.blocks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(Arena::rounded(0), 4);
        assert_eq!(Arena::rounded(1), 4);
        assert_eq!(Arena::rounded(4), 4);
        assert_eq!(Arena::rounded(5), 8);
        assert_eq!(Arena::rounded(31), 32);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut arena = Arena::new();
        let slots: Vec<Slot> = (0..1000).map(|_| arena.allocate(12).unwrap()).collect();
        for (i, &slot) in slots.iter().enumerate() {
            arena.get_mut(slot).copy_from_slice(&(i as u32).to_le_bytes().repeat(3));
        }
        for (i, &slot) in slots.iter().enumerate() {
            assert_eq!(&arena.get(slot)[..4], &(i as u32).to_le_bytes());
        }
        assert_eq!(arena.stats().live, 1000);
    }

    #[test]
    fn test_release_recycles_slot() {
        let mut arena = Arena::new();
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(10).unwrap();
        arena.get_mut(b).fill(0xAB);
        arena.release(a, 10);
        let c = arena.allocate(9).unwrap(); // same class as 10
        assert_eq!(a, c);
        assert!(arena.get(b).iter().all(|&x| x == 0xAB));
        assert_eq!(arena.stats().live, 2);
    }

    #[test]
    fn test_classes_are_separate() {
        let mut arena = Arena::new();
        let small = arena.allocate(4).unwrap();
        arena.release(small, 4);
        let big = arena.allocate(64).unwrap();
        assert_ne!(small, big);
        assert_eq!(arena.get(big).len(), 64);
    }

    #[test]
    fn test_blocks_grow_geometrically() {
        let mut arena = Arena::new();
        // 64-byte items: first block holds 64 items, the next 128.
        for _ in 0..64 {
            arena.allocate(64).unwrap();
        }
        assert_eq!(arena.stats().blocks, 1);
        arena.allocate(64).unwrap();
        assert_eq!(arena.stats().blocks, 2);
        assert_eq!(arena.stats().reserved_bytes, 64 * 64 + 128 * 64);
    }

    #[test]
    fn test_limit_is_fatal() {
        let mut arena = Arena::with_limit(8 * 1024);
        let mut result = Ok(Slot::default());
        for _ in 0..10_000 {
            result = arena.allocate(16);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ArenaError::Exhausted { .. })));
    }

    #[test]
    fn test_transfer_between_arenas() {
        let mut left = Arena::new();
        let mut right = Arena::new();

        let slot = left.allocate(6).unwrap();
        left.get_mut(slot)[..6].copy_from_slice(b"abcdef");
        let transfer = left.transfer_out(slot, 6);
        assert_eq!(left.stats().live, 0);
        assert_eq!(transfer.len(), 8);

        let adopted = right.transfer_in(transfer);
        assert_eq!(&right.get(adopted)[..6], b"abcdef");

        // Adopted slots join the class free list once released.
        right.release(adopted, 6);
        assert_eq!(right.allocate(7).unwrap(), adopted);
    }

    #[test]
    fn test_adopted_slot_moves_on_without_copy() {
        let mut a = Arena::new();
        let mut b = Arena::new();
        let mut c = Arena::new();

        let slot = a.allocate(4).unwrap();
        a.get_mut(slot).copy_from_slice(&[1, 2, 3, 4]);
        let in_b = b.transfer_in(a.transfer_out(slot, 4));
        let reserved = b.stats().reserved_bytes;
        let t = b.transfer_out(in_b, 4);
        assert_eq!(b.stats().reserved_bytes, reserved - 4);
        let in_c = c.transfer_in(t);
        assert_eq!(c.get(in_c), &[1, 2, 3, 4]);
    }
}
