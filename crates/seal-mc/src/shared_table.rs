//! Dedup table shared by all workers.
//!
//! The alternative to per-worker shards: one table, one bucket mutex per cache
//! line worth of cells, and a table-wide `RwLock` that inserters hold for
//! reading. Growth takes the lock for writing, so it stops every inserter for
//! the duration of the rehash.

use crate::table::TableError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Cells per bucket.
const BUCKET: usize = 4;

/// Hashing and equality for table values.
pub trait Hasher<T>: Sync {
    /// Non-zero hash of `value`.
    fn hash(&self, value: &T) -> u64;
    fn equal(&self, a: &T, b: &T) -> bool;
}

struct Bucket<T> {
    cells: Vec<(u64, T)>,
}

struct Inner<T> {
    buckets: Vec<Mutex<Bucket<T>>>,
    mask: usize,
}

impl<T> Inner<T> {
    fn with_buckets(count: usize) -> Self {
        let buckets = (0..count)
            .map(|_| {
                Mutex::new(Bucket {
                    cells: Vec::with_capacity(BUCKET),
                })
            })
            .collect();
        Self {
            buckets,
            mask: count - 1,
        }
    }

    /// Bucket of the `r`-th probe: triangular steps over a power-of-two count.
    #[inline]
    fn bucket(&self, hash: u64, r: usize) -> usize {
        (hash as usize).wrapping_add(r.wrapping_mul(r + 1) / 2) & self.mask
    }

    fn slots(&self) -> usize {
        self.buckets.len() * BUCKET
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A concurrent set with at-most-once insertion.
pub struct SharedTable<T, H> {
    inner: RwLock<Inner<T>>,
    hasher: H,
    len: AtomicUsize,
    growing: AtomicBool,
    max_slots: usize,
}

impl<T: Clone, H: Hasher<T>> SharedTable<T, H> {
    pub fn new(capacity: usize, hasher: H) -> Self {
        Self::with_limit(capacity, usize::MAX, hasher)
    }

    pub fn with_limit(capacity: usize, max_slots: usize, hasher: H) -> Self {
        let buckets = capacity.div_ceil(BUCKET).max(1).next_power_of_two();
        Self {
            inner: RwLock::new(Inner::with_buckets(buckets)),
            hasher,
            len: AtomicUsize::new(0),
            growing: AtomicBool::new(false),
            max_slots: max_slots.max(buckets * BUCKET),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn find(&self, value: &T) -> Option<T> {
        let hash = self.hasher.hash(value);
        let inner = self.read();
        for r in 0..inner.buckets.len() {
            let bucket = lock(&inner.buckets[inner.bucket(hash, r)]);
            for (h, v) in &bucket.cells {
                if *h == hash && self.hasher.equal(v, value) {
                    return Some(v.clone());
                }
            }
            if bucket.cells.len() < BUCKET {
                return None;
            }
        }
        None
    }

    /// Insert `value` unless an equal value is present. Every racer inserting
    /// equal values gets back the single stored value; exactly one of them
    /// sees `true`.
    pub fn insert_or_find(&self, value: T) -> Result<(T, bool), TableError> {
        let hash = self.hasher.hash(&value);
        loop {
            let outcome = {
                let inner = self.read();
                Self::probe(&inner, &self.hasher, hash, &value)
            };
            match outcome {
                Some((stored, true)) => {
                    let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
                    self.maybe_grow(len)?;
                    return Ok((stored, true));
                }
                Some((stored, false)) => return Ok((stored, false)),
                // Every bucket on the sequence is full: force a growth.
                None => self.grow(self.len.load(Ordering::Relaxed))?,
            }
        }
    }

    fn probe(inner: &Inner<T>, hasher: &H, hash: u64, value: &T) -> Option<(T, bool)> {
        for r in 0..inner.buckets.len() {
            let mut bucket = lock(&inner.buckets[inner.bucket(hash, r)]);
            for (h, v) in &bucket.cells {
                if *h == hash && hasher.equal(v, value) {
                    return Some((v.clone(), false));
                }
            }
            if bucket.cells.len() < BUCKET {
                bucket.cells.push((hash, value.clone()));
                return Some((value.clone(), true));
            }
        }
        None
    }

    fn maybe_grow(&self, len: usize) -> Result<(), TableError> {
        let slots = self.read().slots();
        if len * 4 > slots * 3 {
            self.grow(len)?;
        }
        Ok(())
    }

    /// Double the table. Only one thread rehashes; the others wait on the lock.
    fn grow(&self, len: usize) -> Result<(), TableError> {
        if self
            .growing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Someone else is growing; block until they are done.
            drop(self.read());
            return Ok(());
        }
        let result = self.rehash(len);
        self.growing.store(false, Ordering::Release);
        result
    }

    fn rehash(&self, len: usize) -> Result<(), TableError> {
        let mut inner = self.write();
        // Another grower may have finished between our load check and the lock.
        if len * 4 <= inner.slots() * 3 && !Self::saturated(&inner) {
            return Ok(());
        }
        let slots = inner.slots() * 2;
        if slots > self.max_slots {
            return Err(TableError::Full {
                requested: slots,
                limit: self.max_slots,
            });
        }
        let fresh = Inner::with_buckets(inner.buckets.len() * 2);
        let old = std::mem::replace(&mut *inner, fresh);
        for bucket in old.buckets {
            let bucket = bucket.into_inner().unwrap_or_else(|e| e.into_inner());
            for (hash, value) in bucket.cells {
                let placed = (0..inner.buckets.len()).any(|r| {
                    let b = inner.bucket(hash, r);
                    let cells = &mut inner.buckets[b]
                        .get_mut()
                        .unwrap_or_else(|e| e.into_inner())
                        .cells;
                    if cells.len() < BUCKET {
                        cells.push((hash, value.clone()));
                        true
                    } else {
                        false
                    }
                });
                if !placed {
                    return Err(TableError::GrowthReentered {
                        entries: self.len.load(Ordering::Relaxed),
                    });
                }
            }
        }
        debug!(slots, "shared dedup table grown");
        Ok(())
    }

    fn saturated(inner: &Inner<T>) -> bool {
        inner
            .buckets
            .iter()
            .all(|b| lock(b).cells.len() == BUCKET)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.read().slots()
    }
}
