//! Private open-addressing dedup table.
//!
//! Cells pair a cached 64-bit hash with a value (a state handle). The cached
//! hash filters candidates before the caller's equality check runs and lets
//! growth rehash without touching the states. Hashes must be non-zero, as
//! block hashes are.
//!
//! Probing walks one cache-line-sized bucket linearly, then jumps to another
//! bucket by a triangular step. With a power-of-two bucket count the bucket
//! sequence `b0 + r(r+1)/2` visits every bucket exactly once, so a probe
//! sequence covers the whole table without repeating a cell.

use thiserror::Error;
use tracing::debug;

/// Probes after which a lookup gives up and reports "not present".
pub const MAX_COLLISIONS: usize = 1 << 16;

/// Cache line size the bucket width is derived from.
const CACHE_LINE: usize = 64;

/// Failures of the dedup table. All of them are fatal to a search.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("dedup table would grow to {requested} slots, over the ceiling of {limit}")]
    Full { requested: usize, limit: usize },

    #[error("dedup table growth reentered: too many collisions while rehashing {entries} entries")]
    GrowthReentered { entries: usize },
}

#[derive(Clone, Copy)]
struct Cell<T: Copy> {
    hash: u64,
    value: T,
}

/// Open-addressing hash set of `Copy` handles with caller-supplied hashing and
/// equality.
pub struct HashSet<T: Copy> {
    cells: Vec<Option<Cell<T>>>,
    /// Cells per bucket (power of two).
    bucket: usize,
    shift: u32,
    mask: usize,
    len: usize,
    /// Ceiling on `cells.len()`.
    max_slots: usize,
    growths: usize,
    collisions: u64,
}

impl<T: Copy> HashSet<T> {
    /// A table with at least `capacity` slots and no growth ceiling.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    /// A table with at least `capacity` slots that refuses to grow past
    /// `max_slots`.
    pub fn with_limit(capacity: usize, max_slots: usize) -> Self {
        let bucket = Self::bucket_width();
        let slots = capacity.max(bucket).next_power_of_two();
        Self {
            cells: vec![None; slots],
            bucket,
            shift: bucket.trailing_zeros(),
            mask: slots - 1,
            len: 0,
            max_slots: max_slots.max(slots),
            growths: 0,
            collisions: 0,
        }
    }

    fn bucket_width() -> usize {
        let per_line = (CACHE_LINE / std::mem::size_of::<Option<Cell<T>>>()).max(1);
        // round down to a power of two
        1 << per_line.ilog2()
    }

    /// Cell index of the `i`-th probe for `hash`.
    #[inline]
    fn index(&self, hash: u64, i: usize) -> usize {
        let r = i >> self.shift;
        let j = i & (self.bucket - 1);
        let b0 = (hash as usize) >> self.shift;
        let tri = r.wrapping_mul(r + 1) / 2;
        ((b0.wrapping_add(tri) << self.shift) | j) & self.mask
    }

    #[inline]
    fn probe_limit(&self) -> usize {
        self.cells.len().min(MAX_COLLISIONS)
    }

    /// Look up an entry with hash `hash` for which `eq` holds.
    pub fn find(&self, hash: u64, eq: impl Fn(&T) -> bool) -> Option<T> {
        debug_assert_ne!(hash, 0);
        for i in 0..self.probe_limit() {
            match &self.cells[self.index(hash, i)] {
                None => return None,
                Some(cell) if cell.hash == hash && eq(&cell.value) => return Some(cell.value),
                Some(_) => {}
            }
        }
        None
    }

    /// Insert `value` unless an equal entry exists.
    ///
    /// Returns the stored value and whether it was newly inserted. An existing
    /// entry is never overwritten.
    pub fn insert_or_find(
        &mut self,
        hash: u64,
        value: T,
        eq: impl Fn(&T) -> bool,
    ) -> Result<(T, bool), TableError> {
        debug_assert_ne!(hash, 0);
        if (self.len + 1) * 4 > self.cells.len() * 3 {
            self.grow()?;
        }
        loop {
            for i in 0..self.probe_limit() {
                let idx = self.index(hash, i);
                match &self.cells[idx] {
                    None => {
                        self.cells[idx] = Some(Cell { hash, value });
                        self.len += 1;
                        return Ok((value, true));
                    }
                    Some(cell) if cell.hash == hash && eq(&cell.value) => {
                        return Ok((cell.value, false));
                    }
                    Some(_) => self.collisions += 1,
                }
            }
            // Probe sequence exhausted below the load threshold: grow and retry.
            self.grow()?;
        }
    }

    fn grow(&mut self) -> Result<(), TableError> {
        let slots = self.cells.len() * 2;
        if slots > self.max_slots {
            return Err(TableError::Full {
                requested: slots,
                limit: self.max_slots,
            });
        }
        let old = std::mem::replace(&mut self.cells, vec![None; slots]);
        self.mask = slots - 1;
        self.growths += 1;
        debug!(slots, entries = self.len, "dedup table grown");

        for cell in old.into_iter().flatten() {
            let mut placed = false;
            for i in 0..self.probe_limit() {
                let idx = self.index(cell.hash, i);
                if self.cells[idx].is_none() {
                    self.cells[idx] = Some(cell);
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(TableError::GrowthReentered { entries: self.len });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of times the table doubled.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Probes that hit an occupied cell holding a different entry.
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    /// Entries in table order (deterministic for a given insertion history).
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.cells.iter().flatten().map(|c| c.value)
    }

    /// Drop every entry, keeping the capacity.
    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(x: u64) -> u64 {
        crate::hash::hash64(&x.to_le_bytes(), 0) | 1
    }

    #[test]
    fn test_probe_sequence_covers_table() {
        let table: HashSet<u32> = HashSet::new(1024);
        for hash in [1u64, 77, 1 << 40, u64::MAX] {
            let mut seen = vec![false; table.capacity()];
            for i in 0..table.capacity() {
                let idx = table.index(hash, i);
                assert!(!seen[idx], "cell {idx} visited twice");
                seen[idx] = true;
            }
        }
    }

    #[test]
    fn test_first_probes_share_a_bucket() {
        let table: HashSet<u64> = HashSet::new(256);
        let first = table.index(12345, 0) / table.bucket;
        for i in 1..table.bucket {
            assert_eq!(table.index(12345, i) / table.bucket, first);
        }
    }

    #[test]
    fn test_insert_at_most_once() {
        let mut table: HashSet<u64> = HashSet::new(16);
        let (v, new) = table.insert_or_find(h(5), 5, |&x| x == 5).unwrap();
        assert!(new);
        assert_eq!(v, 5);
        // Same key, different payload: the original survives.
        let (v, new) = table.insert_or_find(h(5), 500, |&x| x == 5).unwrap();
        assert!(!new);
        assert_eq!(v, 5);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_completeness_across_growth() {
        let mut table: HashSet<u64> = HashSet::new(16);
        for x in 0..10_000u64 {
            table.insert_or_find(h(x), x, |&y| y == x).unwrap();
        }
        assert!(table.growths() > 0);
        assert_eq!(table.len(), 10_000);
        for x in 0..10_000u64 {
            assert_eq!(table.find(h(x), |&y| y == x), Some(x));
        }
        assert_eq!(table.find(h(10_001), |&y| y == 10_001), None);
        assert!(table.len() * 4 <= table.capacity() * 3);
    }

    #[test]
    fn test_hash_collisions_resolved_by_equality() {
        let mut table: HashSet<u64> = HashSet::new(16);
        for x in 0..100u64 {
            let (_, new) = table.insert_or_find(42, x, |&y| y == x).unwrap();
            assert!(new);
        }
        for x in 0..100u64 {
            assert_eq!(table.find(42, |&y| y == x), Some(x));
        }
        assert!(table.collisions() > 0);
    }

    #[test]
    fn test_ceiling() {
        let mut table: HashSet<u64> = HashSet::with_limit(16, 32);
        let mut err = None;
        for x in 0..100u64 {
            if let Err(e) = table.insert_or_find(h(x), x, |&y| y == x) {
                err = Some(e);
                break;
            }
        }
        assert!(matches!(err, Some(TableError::Full { limit: 32, .. })));
    }

    #[test]
    fn test_clear_and_iter() {
        let mut table: HashSet<u64> = HashSet::new(64);
        for x in 1..=10u64 {
            table.insert_or_find(h(x), x, |&y| y == x).unwrap();
        }
        let mut all: Vec<u64> = table.iter().collect();
        all.sort();
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.find(h(3), |&y| y == 3), None);
    }
}
