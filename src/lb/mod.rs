//! The lock-based table.
//!
//! Readers never lock. Writers take the lock of the primary bucket their key hashes to, and keep
//! it for the duration of a single insert or removal. A resize claims every bucket of the old
//! generation by moving its lock into the resize state for good; writers that run into such a
//! bucket help with the migration and then retry on the new generation.

pub(crate) mod bucket;

use crate::config::Config;
use crate::error::Result;
use crate::gc::{self, Registry, Worker};
use crate::generation::{Chain, Generation};
use crate::hash::hash_key;
use crate::lock::{Acquire, TryLock};
use crate::reclaim::{Guard, Shared};
use crate::resize::ResizeDirection;
use crate::{DefaultHashBuilder, Key, Value};
use bucket::{Bucket, Inserted};
use crossbeam_utils::Backoff;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::atomic::Ordering;

/// A concurrent hash table from non-zero `u64` keys to `u64` values with per-bucket locks.
///
/// Every operation takes the calling thread's [`Worker`], obtained once per thread through
/// [`LockTable::register`].
///
/// ```
/// use clht::LockTable;
///
/// let table = LockTable::new(64);
/// let worker = table.register(0);
/// assert!(table.put(7, 42, &worker));
/// assert!(!table.put(7, 43, &worker));
/// assert_eq!(table.get(7, &worker), Some(42));
/// assert_eq!(table.remove(7, &worker), Some(42));
/// assert_eq!(table.get(7, &worker), None);
/// ```
pub struct LockTable<S = DefaultHashBuilder> {
    chain: Chain<Bucket>,
    resize_lock: TryLock,
    status_lock: TryLock,
    registry: Registry,
    config: Config,
    build_hasher: S,
    id: usize,
}

impl LockTable<DefaultHashBuilder> {
    /// Creates a table with room for at least `buckets` buckets.
    ///
    /// The bucket count is rounded up to a power of two and to the configured minimum.
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

impl<S> LockTable<S>
where
    S: BuildHasher,
{
    /// Creates a table that hashes keys with `build_hasher`.
    ///
    /// # Panics
    ///
    /// Panics if the initial buckets cannot be allocated.
    pub fn with_hasher(buckets: usize, build_hasher: S) -> Self {
        match Self::with_config_and_hasher(buckets, Config::default(), build_hasher) {
            Ok(table) => table,
            Err(e) => panic!("failed to create table: {}", e),
        }
    }

    pub fn with_config_and_hasher(buckets: usize, config: Config, build_hasher: S) -> Result<Self> {
        config.validate()?;
        let n = config.initial_buckets(buckets);
        let first = Generation::try_new(n, 0, config.expand_threshold(n))?;
        Ok(LockTable {
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

    /// Looks `key` up without locking. Returns `None` if the bucket was migrated away in the
    /// meantime and the answer may be stale.
    #[inline]
    fn lookup(
        &self,
        gen: &Generation<Bucket>,
        bucket: &Bucket,
        key: Key,
        guard: &Guard<'_>,
    ) -> Option<Option<Value>> {
        let found = bucket.find(key);
        if bucket.lock.is_resizing() && !self.chain.is_current(gen, guard) {
            None
        } else {
            Some(found)
        }
    }

    /// Returns the value stored for `key`.
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
            if let Some(found) = self.lookup(gen, gen.bucket_for(hash), key, &guard) {
                return found;
            }
        }
    }

    /// Inserts `key` unless it is already present. Returns whether the insert happened.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`, which marks empty slots.
    pub fn put(&self, key: Key, val: Value, worker: &Worker) -> bool {
        assert_ne!(key, 0, "key 0 marks empty slots and cannot be stored");
        self.check_worker(worker);
        let hash = self.hash(key);

        let grow = {
            let guard = self.chain.collector.enter();
            loop {
                let shared = self.chain.pin(worker, &guard);
                // safety: as in `get`.
                let gen = unsafe { shared.deref() };
                let bucket = gen.bucket_for(hash);
                if let Some(Some(_)) = self.lookup(gen, bucket, key, &guard) {
                    return false;
                }
                match bucket.lock.lock() {
                    Acquire::Locked => {}
                    Acquire::Resizing => {
                        self.help_resize(shared, bucket, &guard);
                        continue;
                    }
                }
                let inserted = bucket.insert_locked(key, val);
                bucket.lock.unlock();
                match inserted {
                    Inserted::Duplicate => return false,
                    Inserted::Slot => break None,
                    Inserted::Overflow => {
                        break (gen.expanded() >= gen.expand_threshold).then_some(gen.version);
                    }
                }
            }
        };

        if let Some(version) = grow {
            // whoever replaced that generation in the meantime has already grown the table
            if self.version() == version {
                log::debug!("too many overflow buckets, forcing a grow");
                self.status(true);
            }
        } else if worker.status_due(self.config.status_interval) {
            self.status(false);
        }
        true
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
            if let Some(None) = self.lookup(gen, bucket, key, &guard) {
                return None;
            }
            match bucket.lock.lock() {
                Acquire::Locked => {}
                Acquire::Resizing => {
                    self.help_resize(shared, bucket, &guard);
                    continue;
                }
            }
            let removed = bucket.remove_locked(key);
            bucket.lock.unlock();
            return removed;
        }
    }

    /// Called by a writer that found `bucket` claimed by a resize out of `gen`.
    ///
    /// Migrates buckets from the top down if the resize accepts helpers, then waits until the
    /// new generation has been installed.
    fn help_resize(&self, gen: Shared<'_, Generation<Bucket>>, bucket: &Bucket, guard: &Guard<'_>) {
        // safety: protected by the caller's guard.
        let old = unsafe { gen.deref() };
        let target = old.tmp.load(Ordering::SeqCst, guard);
        // safety: the target is retired only after it was installed and later collected, and
        // the guard protects it until then.
        if let Some(target) = unsafe { target.as_ref() } {
            if let Some(_helper) = target.migration.enter(self.config.resize_helpers) {
                while let Some(i) = target.migration.claim_one() {
                    if !self.migrate(old.bucket(i), target) {
                        break;
                    }
                }
            }
        }

        let backoff = Backoff::new();
        while bucket.lock.is_resizing() && self.chain.is_current(old, guard) {
            backoff.snooze();
        }
    }

    /// Claims `bucket` and copies its chain into `target`. Returns `false` if someone else had
    /// already claimed it.
    fn migrate(&self, bucket: &Bucket, target: &Generation<Bucket>) -> bool {
        if !bucket.lock.lock_for_resize() {
            return false;
        }
        for b in bucket.chain() {
            for (key, val) in b.slots.entries() {
                if target.bucket_for(self.hash(key)).insert_unique(key, val) {
                    target.expanded();
                }
            }
        }
        true
    }

    /// Replaces the current generation with a bigger or smaller one.
    ///
    /// Returns `Ok(false)` if another resize is already running or the table cannot move in
    /// that direction.
    pub fn resize(&self, direction: ResizeDirection) -> Result<bool> {
        let resize_lock = match self.resize_lock.try_lock() {
            Some(lock) => lock,
            None => return Ok(false),
        };
        let guard = self.chain.collector.enter();
        let shared = self.chain.current(&guard);
        // safety: current is protected by the guard.
        let old = unsafe { shared.deref() };
        let buckets = match direction.target(old.len(), &self.config) {
            Some(n) => n,
            None => return Ok(false),
        };

        let new = Generation::try_new(
            buckets,
            old.version + 1,
            self.config.expand_threshold(buckets),
        )?;
        // folding several buckets into one is not safe to do concurrently
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

        // low to high; helpers come from the top and we stop where we meet them
        for b in old.buckets() {
            if !self.migrate(b, new) {
                break;
            }
        }
        new.migration.close();
        self.chain.install(shared, target, &guard);
        log::debug!("installed version {} with {} buckets", new.version, buckets);

        let again = new.expansions() >= new.expand_threshold;
        drop(guard);
        drop(resize_lock);

        self.chain.collect(&self.registry);
        if again {
            self.status(true);
        }
        Ok(true)
    }

    /// Checks the fill level of the table and grows or shrinks it if needed, then collects old
    /// generations. `force` grows the table even if it is not full.
    ///
    /// Returns the number of entries found, or 0 if another status check was already running.
    /// A forced check goes ahead regardless, since it is usually issued from inside one.
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

    /// Number of entries in the current generation.
    ///
    /// Not a snapshot: entries inserted or removed concurrently may or may not be counted.
    pub fn size(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bytes used by the buckets of the current generation, overflow buckets included.
    pub fn size_in_bytes(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.footprint()
    }

    /// Bytes held by old generations that have not been collected yet.
    pub fn size_of_garbage(&self) -> usize {
        self.chain.garbage()
    }

    /// Number of primary buckets in the current generation.
    pub fn bucket_count(&self) -> usize {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.len()
    }

    /// Version of the current generation. Starts at 0 and goes up by one with every resize.
    pub fn version(&self) -> u64 {
        let guard = self.chain.collector.enter();
        // safety: current is protected by the guard.
        unsafe { self.chain.current(&guard).deref() }.version
    }

    /// Number of generations still allocated, the current one included.
    pub fn generations(&self) -> usize {
        self.chain.generations()
    }

    /// Frees old generations that no registered worker can still be using.
    /// Returns the number of generations freed.
    pub fn gc_collect(&self) -> usize {
        self.chain.collect(&self.registry)
    }

    /// Frees all old generations, ignoring worker watermarks.
    pub fn gc_collect_all(&self) -> usize {
        self.chain.collect_all()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<S> fmt::Debug for LockTable<S>
where
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("buckets", &self.bucket_count())
            .field("version", &self.version())
            .field("workers", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Jenkins;

    fn table() -> LockTable<Jenkins> {
        LockTable::with_hasher(8, Jenkins)
    }

    #[test]
    fn basics() {
        let t = table();
        let w = t.register(0);
        assert!(t.is_empty());
        assert!(t.put(1, 10, &w));
        assert!(!t.put(1, 11, &w));
        assert_eq!(t.get(1, &w), Some(10));
        assert_eq!(t.get(2, &w), None);
        assert_eq!(t.get(0, &w), None);
        assert_eq!(t.remove(0, &w), None);
        assert_eq!(t.size(), 1);
        assert_eq!(t.remove(1, &w), Some(10));
        assert_eq!(t.remove(1, &w), None);
        assert!(t.is_empty());
    }

    #[test]
    #[should_panic(expected = "key 0")]
    fn zero_key() {
        let t = table();
        let w = t.register(0);
        t.put(0, 1, &w);
    }

    #[test]
    #[should_panic(expected = "different table")]
    fn foreign_worker() {
        let t1 = table();
        let t2 = table();
        let w = t1.register(0);
        t2.get(1, &w);
    }

    #[test]
    fn explicit_resize() {
        let t = table();
        let w = t.register(0);
        for k in 1..=20 {
            assert!(t.put(k, k * 2, &w));
        }
        let v = t.version();
        let n = t.bucket_count();
        assert!(t.resize(ResizeDirection::Grow { factor: 4 }).unwrap());
        assert_eq!(t.bucket_count(), n * 4);
        assert_eq!(t.version(), v + 1);
        for k in 1..=20 {
            assert_eq!(t.get(k, &w), Some(k * 2));
        }
        assert_eq!(t.size(), 20);
        // the worker still pins the old generation
        assert!(t.generations() >= 2);
        assert!(t.size_of_garbage() > 0);
        w.quiesce();
        assert!(t.gc_collect() >= 1);
        assert_eq!(t.generations(), 1);
        assert_eq!(t.size_of_garbage(), 0);

        assert!(t.resize(ResizeDirection::Shrink).unwrap());
        assert!(t.bucket_count() < n * 4);
        for k in 1..=20 {
            assert_eq!(t.get(k, &w), Some(k * 2));
        }
        // already at the minimum
        assert!(!t.resize(ResizeDirection::Shrink).unwrap());
    }

    #[test]
    fn overflow_forces_grow() {
        let t = table();
        let w = t.register(0);
        // 8 buckets may create 8 overflow buckets before a grow is forced
        for k in 1..=200 {
            assert!(t.put(k, k, &w));
        }
        assert!(t.bucket_count() > 8);
        assert!(t.version() > 0);
        for k in 1..=200 {
            assert_eq!(t.get(k, &w), Some(k));
        }
    }

    /// Hands keys through unchanged, so a key's bucket is its low bits.
    #[derive(Default)]
    struct Identity(u64);

    impl std::hash::Hasher for Identity {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, _: &[u8]) {
            unreachable!("keys are hashed with write_u64");
        }

        fn write_u64(&mut self, i: u64) {
            self.0 = i;
        }
    }

    #[test]
    fn grows_until_the_overflow_is_gone() {
        let config = Config::default().expansions_per_bucket(0);
        let t = LockTable::with_config_and_hasher(
            8,
            config,
            std::hash::BuildHasherDefault::<Identity>::default(),
        )
        .unwrap();
        let w = t.register(0);
        // same bucket up to 64 buckets; 128 splits them two and two
        for k in [64, 128, 192, 256] {
            assert!(t.put(k, k, &w));
        }
        assert_eq!(t.bucket_count(), 128);
        assert_eq!(t.version(), 4);
        assert_eq!(t.size_in_bytes(), 128 * crate::BUCKET_SIZE);
        for k in [64, 128, 192, 256] {
            assert_eq!(t.get(k, &w), Some(k));
        }
    }

    #[test]
    fn periodic_status() {
        let config = Config::default().status_interval(Some(10));
        let t = LockTable::with_config_and_hasher(1024, config, Jenkins).unwrap();
        let w = t.register(0);
        for k in 1..=100 {
            t.put(k, k, &w);
        }
        // 100 entries in 1024 buckets is 3% full
        assert!(t.bucket_count() < 1024);
        assert_eq!(t.size(), 100);
    }

    #[test]
    fn invalid_config() {
        use crate::Error;
        let r = LockTable::with_config(8, Config::default().min_buckets(3));
        assert!(matches!(r, Err(Error::InvalidConfig(_))));
    }
}
