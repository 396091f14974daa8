//! The lock-free table.
//!
//! Each bucket is guarded by a single snapshot word that writers update with compare-and-swap.
//! Buckets have no overflow chain; an insert that keeps finding its bucket full grows the table.
//! A resize freezes the old buckets one by one, copies them, and swaps in the new generation once
//! every bucket has been copied. If a bucket of the new generation runs out of slots, the attempt
//! is abandoned, the old buckets are thawed, and the resize starts over with a larger target.

pub(crate) mod bucket;

use crate::config::Config;
use crate::error::Result;
use crate::gc::{self, Registry, Worker};
use crate::generation::{Chain, Generation};
use crate::hash::hash_key;
use crate::lock::TryLock;
use crate::reclaim::{Guard, RetireShared, Shared};
use crate::resize::{transfer_stride, ResizeDirection};
use crate::{DefaultHashBuilder, Key, Value};
use bucket::{Bucket, Insert, Remove};
use crossbeam_utils::Backoff;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::Ordering;

/// A lock-free concurrent hash table from non-zero `u64` keys to `u64` values.
///
/// ```
/// use clht::LockFreeTable;
///
/// let table = LockFreeTable::new(64);
/// let worker = table.register(0);
/// assert!(table.put(7, 42, &worker));
/// assert_eq!(table.get(7, &worker), Some(42));
/// assert_eq!(table.remove(7, &worker), Some(42));
/// ```
pub struct LockFreeTable<S = DefaultHashBuilder> {
    chain: Chain<Bucket>,
    resize_lock: TryLock,
    status_lock: TryLock,
    registry: Registry,
    config: Config,
    build_hasher: S,
    id: usize,
}

impl LockFreeTable<DefaultHashBuilder> {
    /// Creates a table with room for at least `buckets` buckets.
    ///
    /// # Panics
    ///
    /// Panics if the initial buckets cannot be allocated.
    pub fn new(buckets: usize) -> Self {
        Self::with_hasher(buckets, DefaultHashBuilder::default())
    }

    /// Creates a table with a custom configuration.
    pub fn with_config(buckets: usize, config: Config) -> Result<Self> {
        Self::with_config_and_hasher(buckets, config, DefaultHashBuilder::default())
    }
}

impl<S> LockFreeTable<S>
where
    S: BuildHasher,
{
    /// Creates a table that hashes keys with `build_hasher`, using [`Config::lock_free`].
    ///
    /// # Panics
    ///
    /// Panics if the initial buckets cannot be allocated.
    pub fn with_hasher(buckets: usize, build_hasher: S) -> Self {
        match Self::with_config_and_hasher(buckets, Config::lock_free(), build_hasher) {
            Ok(table) => table,
            Err(e) => panic!("failed to create table: {}", e),
        }
    }

    pub fn with_config_and_hasher(buckets: usize, config: Config, build_hasher: S) -> Result<Self> {
        config.validate()?;
        let n = config.initial_buckets(buckets);
        let first = Generation::try_new(n, 0, config.expand_threshold(n))?;
        Ok(LockFreeTable {
            chain: Chain::new(first),
            resize_lock: TryLock::new(),
            status_lock: TryLock::new(),
            registry: Registry::new(),
            config,
            build_hasher,
            id: gc::next_table_id(),
        })
    }

    /// Registers the calling thread. `thread_id` is only used for diagnostics.
    pub fn register(&self, thread_id: usize) -> Worker {
        self.registry.register(self.id, thread_id)
    }

    #[inline]
    fn check_worker(&self, worker: &Worker) {
        assert_eq!(
            worker.table(),
            self.id,
            "attempted to use a worker registered with a different table"
        );
    }

    #[inline]
    fn hash(&self, key: Key) -> u64 {
        hash_key(&self.build_hasher, key)
    }

    /// Returns the value stored for `key`. Never blocks, not even on a resize in progress.
    pub fn get(&self, key: Key, worker: &Worker) -> Option<Value> {
        self.check_worker(worker);
        if key == 0 {
            return None;
        }
        let hash = self.hash(key);
        let guard = self.chain.collector.enter();
        loop {
            let gen = self.chain.pin(worker, &guard);
            // safety: pinned generations stay allocated for as long as the guard lives.
            let gen = unsafe { gen.deref() };
            let (found, s) = gen.bucket_for(hash).find(key);
            // a frozen bucket of a replaced generation may be missing newer writes
            if s.is_frozen() && !self.chain.is_current(gen, &guard) {
                continue;
            }
            return found;
        }
    }

    /// Inserts `key` unless it is already present. Returns whether the insert happened.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`.
    pub fn put(&self, key: Key, val: Value, worker: &Worker) -> bool {
        assert_ne!(key, 0, "key 0 marks empty slots and cannot be stored");
        self.check_worker(worker);
        let hash = self.hash(key);
        loop {
            let inserted = {
                let guard = self.chain.collector.enter();
                loop {
                    let shared = self.chain.pin(worker, &guard);
                    // safety: as in `get`.
                    let gen = unsafe { shared.deref() };
                    let bucket = gen.bucket_for(hash);
                    match bucket.insert(key, val, self.config.no_empty_slot_tries) {
                        Insert::Inserted => break Some(true),
                        Insert::Duplicate => break Some(false),
                        Insert::Frozen => self.help_resize(shared, bucket, &guard),
                        Insert::Full => break None,
                    }
                }
            };
            match inserted {
                Some(true) => {
                    if worker.status_due(self.config.status_interval) {
                        self.status(false);
                    }
                    return true;
                }
                Some(false) => return false,
                None => {
                    log::debug!(
                        "bucket still full after {} tries, forcing a grow",
                        self.config.no_empty_slot_tries
                    );
                    if let Err(e) = self.resize(ResizeDirection::Grow { factor: 2 }) {
                        log::warn!("emergency grow failed: {}", e);
                    }
                }
            }
        }
    }

    /// Removes `key` and returns the value it had.
    pub fn remove(&self, key: Key, worker: &Worker) -> Option<Value> {
        self.check_worker(worker);
        if key == 0 {
            return None;
        }
        let hash = self.hash(key);
        let guard = self.chain.collector.enter();
        loop {
            let shared = self.chain.pin(worker, &guard);
            // safety: as in `get`.
            let gen = unsafe { shared.deref() };
            let bucket = gen.bucket_for(hash);
            match bucket.remove(key) {
                Remove::Removed(val) => return Some(val),
                Remove::Absent => return None,
                Remove::Frozen => self.help_resize(shared, bucket, &guard),
            }
        }
    }

    /// Called by a writer that found `bucket` frozen. Joins the migration if the resize accepts
    /// helpers, then waits until the bucket is either replaced or thawed.
    fn help_resize(&self, gen: Shared<'_, Generation<Bucket>>, bucket: &Bucket, guard: &Guard<'_>) {
        // safety: protected by the caller's guard.
        let old = unsafe { gen.deref() };
        let target = old.tmp.load(Ordering::SeqCst, guard);
        // safety: abandoned targets are retired through the collector, so the guard keeps this
        // one alive even if the attempt it belongs to is given up.
        if let Some(target) = unsafe { target.as_ref() } {
            if let Some(_helper) = target.migration.enter(self.config.resize_helpers) {
                self.transfer(old, target);
            }
        }

        let backoff = Backoff::new();
        while bucket.load().is_frozen() && self.chain.is_current(old, guard) {
            backoff.snooze();
        }
    }

    /// Migrates ranges of old buckets, highest first, until none are left or the attempt is
    /// abandoned.
    fn transfer(&self, old: &Generation<Bucket>, new: &Generation<Bucket>) {
        let stride = transfer_stride(old.len());
        while !new.migration.is_abandoned() {
            let range = match new.migration.claim_range(stride) {
                Some(range) => range,
                None => return,
            };
            for i in range.rev() {
                let b = old.bucket(i);
                let s = b.freeze();
                for (key, val) in b.entries(s) {
                    if !new.bucket_for(self.hash(key)).insert_unique(key, val) {
                        new.migration.abandon();
                        return;
                    }
                }
                new.migration.migrated(1);
            }
        }
    }

    /// Replaces the current generation with a bigger or smaller one.
    ///
    /// A grow whose target runs out of space in some bucket is retried with twice the factor.
    /// Returns `Ok(false)` if another resize is running or the table cannot move in that
    /// direction.
    pub fn resize(&self, direction: ResizeDirection) -> Result<bool> {
        let resize_lock = match self.resize_lock.try_lock() {
            Some(lock) => lock,
            None => return Ok(false),
        };
        let guard = self.chain.collector.enter();
        let shared = self.chain.current(&guard);
        // safety: current is protected by the guard.
        let old = unsafe { shared.deref() };
        let mut direction = direction;
        loop {
            let buckets = match direction.target(old.len(), &self.config) {
                Some(n) => n,
                None => return Ok(false),
            };
            let new = Generation::try_new(
                buckets,
                old.version + 1,
                self.config.expand_threshold(buckets),
            )?;
            new.migration
                .open(old.len(), direction.is_grow() && self.config.resize_helpers > 0);
            log::debug!(
                "resizing from {} to {} buckets (version {})",
                old.len(),
                buckets,
                new.version
            );
            let target = Shared::boxed(new, &self.chain.collector);
            // safety: we just allocated it.
            let new = unsafe { target.deref() };
            old.tmp.store(target, Ordering::SeqCst);

            self.transfer(old, new);
            new.migration.close();

            if !new.migration.is_abandoned() {
                debug_assert_eq!(new.migration.migrated_count(), old.len());
                self.chain.install(shared, target, &guard);
                log::debug!("installed version {} with {} buckets", new.version, buckets);
                break;
            }

            for b in old.buckets() {
                b.thaw();
            }
            old.tmp.store(Shared::null(), Ordering::SeqCst);
            // safety: the target was never installed, it is no longer reachable through
            // `old.tmp`, and every helper that entered it has left.
            unsafe { guard.retire_shared(target) };
            direction = match direction {
                ResizeDirection::Grow { factor } => {
                    log::warn!(
                        "a bucket overflowed while growing by {}, retrying with {}",
                        factor,
                        factor * 2
                    );
                    ResizeDirection::Grow { factor: factor * 2 }
                }
                ResizeDirection::Shrink => {
                    log::warn!("a bucket overflowed while shrinking, giving up");
                    return Ok(false);
                }
            };
        }
        drop(guard);
        drop(resize_lock);
        self.chain.collect(&self.registry);
        Ok(true)
    }

    /// Checks the fill level and grows or shrinks the table if needed, then collects old
    /// generations. Returns the number of entries found, or 0 if another status check was
    /// already running. A forced check goes ahead regardless.
    pub fn status(&self, force: bool) -> usize {
        let _lock = match self.status_lock.try_lock() {
            Some(lock) => Some(lock),
            None if force => None,
            None => return 0,
        };
        let occupancy = {
            let guard = self.chain.collector.enter();
            // safety: current is protected by the guard.
            unsafe { self.chain.current(&guard).deref() }.occupancy()
        };
        if let Some(direction) = occupancy.decide(&self.config, force) {
            if let Err(e) = self.resize(direction) {
                log::warn!("{:?} failed: {}", direction, e);
            }
        }
        self.chain.collect(&self.registry);
        occupancy.size
    }

    /// Number of entries in the current generation. Concurrent writes may or may not be
    /// counted.
    pub fn size(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.size()
    }

    /// Whether [`size`](Self::size) is 0.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bytes used by the buckets of the current generation.
    pub fn size_in_bytes(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.footprint()
    }

    /// Bytes held by replaced generations that have not been freed yet.
    pub fn size_of_garbage(&self) -> usize {
        self.chain.garbage()
    }

    /// Number of buckets in the current generation.
    pub fn bucket_count(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.len()
    }

    /// Version of the current generation, bumped by every resize.
    pub fn version(&self) -> u64 {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.version
    }

    /// Number of generations still allocated, the current one included.
    pub fn generations(&self) -> usize {
        self.chain.generations()
    }

    /// Frees old generations below the lowest watermark of the registered workers, and
    /// returns how many were freed.
    pub fn gc_collect(&self) -> usize {
        self.chain.collect(&self.registry)
    }

    /// Frees all old generations regardless of watermarks. Readers still inside one keep it
    /// alive until they leave.
    pub fn gc_collect_all(&self) -> usize {
        self.chain.collect_all()
    }

    /// The configuration the table was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<S> fmt::Debug for LockFreeTable<S>
where
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeTable")
            .field("buckets", &self.bucket_count())
            .field("version", &self.version())
            .field("workers", &self.registry)
            .finish()
    }
}
