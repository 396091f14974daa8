//! What the persistent table keeps in its pool.

use super::pool::{AtomicOff, POff, Pool, PoolSafe};
use crate::error::{Error, Result};
use crate::lb::bucket::{Inserted, Slots};
use crate::lock::{BucketLock, TryLock};
use crate::resize::{Migration, Occupancy};
use crate::{Key, Value, BUCKET_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

unsafe impl PoolSafe for BucketLock {}
unsafe impl PoolSafe for TryLock {}
unsafe impl PoolSafe for Slots {}
unsafe impl PoolSafe for Migration {}

/// The fixed entry point of a table.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct Root {
    pub(crate) current: AtomicOff<Generation>,
    /// Start of the list of generations that have not been freed, linked through `next`.
    pub(crate) oldest: AtomicOff<Generation>,
    pub(crate) version_min: AtomicU64,
    pub(crate) resize_lock: TryLock,
    pub(crate) status_lock: TryLock,
    pub(crate) gc_lock: TryLock,
}

unsafe impl PoolSafe for Root {}

impl Root {
    /// Releases all table-level locks. Only valid while nobody else uses the table.
    pub(crate) fn reset_locks(&self) {
        self.resize_lock.reset();
        self.status_lock.reset();
        self.gc_lock.reset();
    }
}

/// Same shape as a heap bucket, with the overflow link stored as an offset.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) lock: BucketLock,
    pub(crate) slots: Slots,
    pub(crate) next: AtomicOff<Bucket>,
}

unsafe impl PoolSafe for Bucket {}

const _: () = assert!(std::mem::size_of::<Bucket>() == BUCKET_SIZE);

impl Bucket {
    pub(crate) fn chain<'p>(&'p self, pool: &'p Pool) -> impl Iterator<Item = &'p Bucket> + 'p {
        let mut b = Some(self);
        std::iter::from_fn(move || {
            let this = b?;
            let next = this.next.load(Ordering::Acquire);
            b = if next.is_null() {
                None
            } else {
                Some(pool.get(next))
            };
            Some(this)
        })
    }

    pub(crate) fn find(&self, pool: &Pool, key: Key) -> Option<Value> {
        self.chain(pool).find_map(|b| b.slots.find(key))
    }

    fn stats(&self, pool: &Pool) -> (usize, usize) {
        self.chain(pool)
            .fold((0, 0), |(n, depth), b| (n + b.slots.len(), depth + 1))
    }
}

/// One generation: a header block plus a separate block of primary buckets.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct Generation {
    pub(crate) buckets: AtomicOff<Bucket>,
    pub(crate) len: AtomicU64,
    pub(crate) version: AtomicU64,
    pub(crate) expand_threshold: AtomicU64,
    pub(crate) expansions: AtomicU64,
    pub(crate) next: AtomicOff<Generation>,
    pub(crate) prev: AtomicOff<Generation>,
    pub(crate) tmp: AtomicOff<Generation>,
    /// Writers currently looking at `tmp` to help a resize out of this generation.
    pub(crate) helping: AtomicU64,
    /// The migration into this generation. Meaningless after a restart.
    pub(crate) migration: Migration,
}

unsafe impl PoolSafe for Generation {}

impl Generation {
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub(crate) fn buckets<'p>(&self, pool: &'p Pool) -> &'p [Bucket] {
        match pool.slice(self.buckets.load(Ordering::Relaxed), self.len()) {
            Ok(b) => b,
            Err(e) => panic!("{}", e),
        }
    }

    #[inline]
    pub(crate) fn bucket_for<'p>(&self, pool: &'p Pool, hash: u64) -> &'p Bucket {
        let mask = self.len() as u64 - 1;
        &self.buckets(pool)[(hash & mask) as usize]
    }

    /// Counts a new overflow bucket. Returns the new total.
    pub(crate) fn expanded(&self) -> usize {
        self.expansions.fetch_add(1, Ordering::Relaxed) as usize + 1
    }

    pub(crate) fn expansions(&self) -> usize {
        self.expansions.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn expand_threshold(&self) -> usize {
        self.expand_threshold.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn occupancy(&self, pool: &Pool) -> Occupancy {
        let mut occupancy = Occupancy::default();
        for b in self.buckets(pool) {
            let (entries, depth) = b.stats(pool);
            occupancy.add_bucket(entries, depth);
        }
        occupancy
    }

    pub(crate) fn size(&self, pool: &Pool) -> usize {
        self.buckets(pool).iter().map(|b| b.stats(pool).0).sum()
    }

    /// Bytes taken by the primary and overflow buckets.
    pub(crate) fn footprint(&self, pool: &Pool) -> usize {
        self.buckets(pool)
            .iter()
            .map(|b| b.stats(pool).1 * BUCKET_SIZE)
            .sum()
    }

    /// Checks a generation read back from a pool that was not shut down cleanly.
    pub(crate) fn validate(&self, pool: &Pool) -> Result<()> {
        let n = self.len();
        if n == 0 || !n.is_power_of_two() {
            return Err(Error::Corrupt(format!("generation with {} buckets", n)));
        }
        pool.slice(self.buckets.load(Ordering::Relaxed), n)?;
        Ok(())
    }
}

/// Stores a new entry in a bucket chain that was just allocated in the pool and is not visible
/// yet. Returns where the entry went.
pub(crate) fn insert_unique(pool: &Pool, bucket: &Bucket, key: Key, val: Value) -> Result<Inserted> {
    let mut last = bucket;
    for b in bucket.chain(pool) {
        if let Some(j) = b.slots.empty() {
            b.slots.store(j, key, val);
            return Ok(Inserted::Slot);
        }
        last = b;
    }
    let off: POff<Bucket> = pool.alloc(1)?;
    let fresh = pool.get(off);
    fresh.slots.store(0, key, val);
    last.next.store(off, Ordering::Release);
    Ok(Inserted::Overflow)
}
