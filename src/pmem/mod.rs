//! The persistent table.
//!
//! Same algorithm as [`LockTable`](crate::LockTable), laid out in a memory-mapped pool file so
//! that its contents survive a restart. Every store that matters after a crash is followed by a
//! flush and a fence through the pool's [`Persister`]:
//!
//!  - a new entry is made durable value first, key second, so a key is never found without its
//!    value;
//!  - a new overflow bucket is flushed before the link to it;
//!  - a new generation is flushed in full before the root is switched over to it.
//!
//! On reopen, the table discards a resize that was still running, frees generations that were
//! replaced but not yet collected, and (unless told otherwise) resets every lock.
//!
//! Keys are hashed with [`jenkins64`] since the placement of entries has to be the same in every
//! process that opens the pool.

pub(crate) mod durable;
pub(crate) mod layout;
pub(crate) mod pool;

pub use durable::{Clflush, FlushPoint, Msync, NoFlush, Persister, Region};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gc::{self, Registry, Worker};
use crate::hash::jenkins64;
use crate::lb::bucket::Inserted;
use crate::lock::{Acquire, LockState, TryLockGuard};
use crate::resize::ResizeDirection;
use crate::{Key, Value};
use crossbeam_utils::Backoff;
use layout::{Bucket, Generation, Root};
use parking_lot::Mutex;
use pool::{POff, Pool};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

/// Default size of a newly created pool file.
pub const DEFAULT_POOL_SIZE: u64 = 64 << 20;

/// Options for creating or reopening a [`PersistentTable`].
///
/// ```no_run
/// use clht::{Msync, PoolOptions};
///
/// let table = PoolOptions::new("/mnt/pmem/index.pool")
///     .size(1 << 30)
///     .buckets(1024)
///     .persister(Msync)
///     .open()?;
/// # Ok::<(), clht::Error>(())
/// ```
#[derive(Debug)]
pub struct PoolOptions {
    path: PathBuf,
    size: u64,
    buckets: usize,
    config: Config,
    persister: Box<dyn Persister>,
    reinitialize_locks: bool,
}

impl PoolOptions {
    pub fn new(path: impl AsRef<Path>) -> Self {
        PoolOptions {
            path: path.as_ref().to_path_buf(),
            size: DEFAULT_POOL_SIZE,
            buckets: 8,
            config: Config::default(),
            persister: Box::new(Clflush),
            reinitialize_locks: true,
        }
    }

    /// Size of the pool file if it has to be created. Ignored when reopening.
    pub fn size(mut self, bytes: u64) -> Self {
        self.size = bytes;
        self
    }

    /// Initial number of buckets if the table has to be created. Ignored when reopening.
    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// How writes are made durable. Defaults to [`Clflush`].
    pub fn persister(mut self, persister: impl Persister + 'static) -> Self {
        self.persister = Box::new(persister);
        self
    }

    /// Whether to reset every bucket lock when reopening a pool. Defaults to `true`.
    ///
    /// Locks held when the previous process died are otherwise left in place; see
    /// [`PersistentTable::held_locks`] and [`PersistentTable::lock_reinitialize`].
    pub fn reinitialize_locks(mut self, yes: bool) -> Self {
        self.reinitialize_locks = yes;
        self
    }

    /// Opens the table in the pool file, creating both if the file is missing or empty.
    pub fn open(self) -> Result<PersistentTable> {
        self.config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if file.metadata()?.len() == 0 {
            let pool = Pool::create(&file, self.size, self.persister)?;
            let table = PersistentTable::create(pool, self.buckets, self.config)?;
            log::info!(
                "created table in {} with {} buckets",
                self.path.display(),
                table.bucket_count()
            );
            Ok(table)
        } else {
            let pool = Pool::open(&file, self.persister)?;
            let table = PersistentTable::recover(pool, self.config, self.reinitialize_locks)?;
            log::info!(
                "reopened table in {} at version {} ({} entries)",
                self.path.display(),
                table.version(),
                table.size()
            );
            Ok(table)
        }
    }
}

/// A lock-based table whose buckets live in a memory-mapped pool file.
///
/// Operations that write return a [`Result`], since they may have to allocate from the pool or
/// flush to it.
///
/// ```
/// use clht::{NoFlush, PoolOptions};
///
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("table.pool");
/// {
///     let table = PoolOptions::new(&path).size(1 << 20).persister(NoFlush).open()?;
///     let worker = table.register(0);
///     assert!(table.put(7, 42, &worker)?);
/// }
/// let table = PoolOptions::new(&path).persister(NoFlush).open()?;
/// let worker = table.register(0);
/// assert_eq!(table.get(7, &worker), Some(42));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PersistentTable {
    pool: Pool,
    root: POff<Root>,
    registry: Registry,
    config: Config,
    resize_error: Mutex<Option<Error>>,
    id: usize,
}

fn alloc_generation(
    pool: &Pool,
    buckets: usize,
    version: u64,
    expand_threshold: usize,
    point: FlushPoint,
) -> Result<POff<Generation>> {
    let array: POff<Bucket> = pool.alloc(buckets)?;
    let off: POff<Generation> = match pool.alloc(1) {
        Ok(off) => off,
        Err(e) => {
            // safety: never published.
            unsafe { pool.free(array, buckets)? };
            return Err(e);
        }
    };
    let gen = pool.get(off);
    gen.buckets.store(array, Ordering::Relaxed);
    gen.len.store(buckets as u64, Ordering::Relaxed);
    gen.version.store(version, Ordering::Relaxed);
    gen.expand_threshold
        .store(expand_threshold as u64, Ordering::Relaxed);
    // recovery may have to free it through `tmp` before it is ever installed
    if let Err(e) = pool.persist(point, gen) {
        // safety: never published.
        unsafe { free_generation(pool, off)? };
        return Err(e);
    }
    Ok(off)
}

/// Flushes a generation with all its buckets.
fn persist_generation(pool: &Pool, gen: &Generation, point: FlushPoint) -> Result<()> {
    let buckets = gen.buckets(pool);
    pool.persist(point, buckets)?;
    for b in buckets {
        for overflow in b.chain(pool).skip(1) {
            pool.persist(point, overflow)?;
        }
    }
    pool.persist(point, gen)
}

/// Hands a generation and its buckets back to the pool.
///
/// # Safety
///
/// The generation must be unreachable from the root, and no thread may still be using it.
unsafe fn free_generation(pool: &Pool, off: POff<Generation>) -> Result<()> {
    let gen = pool.try_get(off)?;
    let n = gen.len();
    let array = gen.buckets.load(Ordering::Relaxed);
    for b in pool.slice(array, n)? {
        let mut next = b.next.load(Ordering::Relaxed);
        while !next.is_null() {
            let after = pool.try_get(next)?.next.load(Ordering::Relaxed);
            pool.free(next, 1)?;
            next = after;
        }
    }
    pool.free(array, n)?;
    pool.free(off, 1)
}

impl PersistentTable {
    /// Opens the table in `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        PoolOptions::new(path).open()
    }

    fn create(pool: Pool, buckets: usize, config: Config) -> Result<Self> {
        let n = config.initial_buckets(buckets);
        let root_off: POff<Root> = pool.alloc(1)?;
        let first = alloc_generation(&pool, n, 0, config.expand_threshold(n), FlushPoint::Init)?;
        persist_generation(&pool, pool.get(first), FlushPoint::Init)?;
        let root = pool.get(root_off);
        root.current.store(first, Ordering::SeqCst);
        root.oldest.store(first, Ordering::SeqCst);
        pool.persist(FlushPoint::Init, root)?;
        // the table exists once the header points at it
        pool.set_root(root_off)?;
        Ok(Self::from_parts(pool, root_off, config))
    }

    fn recover(pool: Pool, config: Config, reinitialize_locks: bool) -> Result<Self> {
        let root_off: POff<Root> = pool.root();
        if root_off.is_null() {
            return Err(Error::Corrupt("pool holds no table".into()));
        }
        let root = pool.try_get(root_off)?;
        root.reset_locks();
        let current = root.current.load(Ordering::SeqCst);
        let gen = pool.try_get(current)?;
        gen.validate(&pool)?;
        gen.migration.reset();
        gen.helping.store(0, Ordering::SeqCst);
        let unfinished = gen.tmp.swap(POff::NULL, Ordering::SeqCst);
        gen.next.store(POff::NULL, Ordering::SeqCst);

        let mut replaced = Vec::new();
        let mut off = root.oldest.load(Ordering::SeqCst);
        while off != current {
            if off.is_null() || replaced.len() as u64 > gen.version() {
                return Err(Error::Corrupt(
                    "old generations do not lead to the current one".into(),
                ));
            }
            replaced.push(off);
            off = pool.try_get(off)?.next.load(Ordering::SeqCst);
        }
        gen.prev.store(POff::NULL, Ordering::SeqCst);
        pool.persist(FlushPoint::Init, gen)?;
        root.oldest.store(current, Ordering::SeqCst);
        root.version_min.store(gen.version(), Ordering::SeqCst);
        pool.persist(FlushPoint::Init, root)?;

        // nothing points at these anymore
        if !unfinished.is_null() {
            log::warn!(
                "discarding an unfinished resize out of version {}",
                gen.version()
            );
            // safety: unlinked above, and nobody else has the pool open.
            unsafe { free_generation(&pool, unfinished)? };
        }
        for &off in &replaced {
            // safety: as above.
            unsafe { free_generation(&pool, off)? };
        }
        if !replaced.is_empty() {
            log::debug!("freed {} replaced generations", replaced.len());
        }

        let mut table = Self::from_parts(pool, root_off, config);
        if reinitialize_locks {
            table.lock_reinitialize();
        }
        Ok(table)
    }

    fn from_parts(pool: Pool, root: POff<Root>, config: Config) -> Self {
        PersistentTable {
            pool,
            root,
            registry: Registry::new(),
            config,
            resize_error: Mutex::new(None),
            id: gc::next_table_id(),
        }
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
    fn root(&self) -> &Root {
        self.pool.get(self.root)
    }

    /// Publishes the version of the current generation and returns it once the publication is
    /// known to protect it.
    fn pin(&self, worker: &Worker) -> (POff<Generation>, &Generation) {
        let root = self.root();
        let mut off = root.current.load(Ordering::SeqCst);
        loop {
            let gen = self.pool.get(off);
            worker.publish(gen.version());
            let now = root.current.load(Ordering::SeqCst);
            if now == off {
                return (off, gen);
            }
            off = now;
        }
    }

    /// Keeps the collector away from the current generation for as long as the guard lives.
    fn hold_gc(&self) -> TryLockGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if let Some(lock) = self.root().gc_lock.try_lock() {
                return lock;
            }
            backoff.snooze();
        }
    }

    fn with_current<R>(&self, f: impl FnOnce(&Generation) -> R) -> R {
        let _gc = self.hold_gc();
        f(self.pool.get(self.root().current.load(Ordering::SeqCst)))
    }

    #[inline]
    fn lookup(&self, gen: POff<Generation>, bucket: &Bucket, key: Key) -> Option<Option<Value>> {
        let found = bucket.find(&self.pool, key);
        if bucket.lock.is_resizing() && self.root().current.load(Ordering::SeqCst) != gen {
            None
        } else {
            Some(found)
        }
    }

    pub fn get(&self, key: Key, worker: &Worker) -> Option<Value> {
        self.check_worker(worker);
        if key == 0 {
            return None;
        }
        let hash = jenkins64(key);
        loop {
            let (off, gen) = self.pin(worker);
            if let Some(found) = self.lookup(off, gen.bucket_for(&self.pool, hash), key) {
                return found;
            }
        }
    }

    /// Inserts `key` unless it is already present. Returns whether the insert happened.
    ///
    /// # Panics
    ///
    /// Panics if `key` is `0`.
    pub fn put(&self, key: Key, val: Value, worker: &Worker) -> Result<bool> {
        assert_ne!(key, 0, "key 0 marks empty slots and cannot be stored");
        self.check_worker(worker);
        let hash = jenkins64(key);

        let grow = loop {
            let (off, gen) = self.pin(worker);
            let bucket = gen.bucket_for(&self.pool, hash);
            if let Some(Some(_)) = self.lookup(off, bucket, key) {
                return Ok(false);
            }
            match bucket.lock.lock() {
                Acquire::Locked => {}
                Acquire::Resizing => {
                    self.help_resize(off, gen, bucket);
                    continue;
                }
            }
            let inserted = self.insert_locked(bucket, key, val);
            bucket.lock.unlock();
            match inserted? {
                Inserted::Duplicate => return Ok(false),
                Inserted::Slot => break None,
                Inserted::Overflow => {
                    break (gen.expanded() >= gen.expand_threshold()).then_some(gen.version());
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
        Ok(true)
    }

    fn write_entry(&self, b: &Bucket, j: usize, key: Key, val: Value) -> Result<()> {
        b.slots.val(j).store(val, Ordering::Release);
        self.pool.persist(FlushPoint::SlotValue, b.slots.val(j))?;
        b.slots.key(j).store(key, Ordering::Release);
        self.pool.persist(FlushPoint::SlotKey, b.slots.key(j))
    }

    fn insert_locked(&self, bucket: &Bucket, key: Key, val: Value) -> Result<Inserted> {
        let mut empty = None;
        let mut last = bucket;
        for b in bucket.chain(&self.pool) {
            if b.slots.position(key).is_some() {
                return Ok(Inserted::Duplicate);
            }
            if empty.is_none() {
                empty = b.slots.empty().map(|j| (b, j));
            }
            last = b;
        }

        if let Some((b, j)) = empty {
            self.write_entry(b, j, key, val)?;
            return Ok(Inserted::Slot);
        }

        let off: POff<Bucket> = self.pool.alloc(1)?;
        let fresh = self.pool.get(off);
        fresh.slots.store(0, key, val);
        self.pool.persist(FlushPoint::BucketCreate, fresh)?;
        last.next.store(off, Ordering::Release);
        self.pool.persist(FlushPoint::BucketLink, &last.next)?;
        Ok(Inserted::Overflow)
    }

    /// Removes `key` and returns the value it had.
    pub fn remove(&self, key: Key, worker: &Worker) -> Result<Option<Value>> {
        self.check_worker(worker);
        if key == 0 {
            return Ok(None);
        }
        let hash = jenkins64(key);
        loop {
            let (off, gen) = self.pin(worker);
            let bucket = gen.bucket_for(&self.pool, hash);
            if let Some(None) = self.lookup(off, bucket, key) {
                return Ok(None);
            }
            match bucket.lock.lock() {
                Acquire::Locked => {}
                Acquire::Resizing => {
                    self.help_resize(off, gen, bucket);
                    continue;
                }
            }
            let removed = self.remove_locked(bucket, key);
            bucket.lock.unlock();
            return removed;
        }
    }

    fn remove_locked(&self, bucket: &Bucket, key: Key) -> Result<Option<Value>> {
        for b in bucket.chain(&self.pool) {
            if let Some(j) = b.slots.position(key) {
                let val = b.slots.val(j).load(Ordering::Relaxed);
                b.slots.key(j).store(0, Ordering::Release);
                self.pool.persist(FlushPoint::SlotRemove, b.slots.key(j))?;
                return Ok(Some(val));
            }
        }
        Ok(None)
    }

    /// Replaces the value of an existing key. Returns `false` if the key is absent.
    pub fn update(&self, key: Key, val: Value, worker: &Worker) -> Result<bool> {
        self.check_worker(worker);
        if key == 0 {
            return Ok(false);
        }
        let hash = jenkins64(key);
        loop {
            let (off, gen) = self.pin(worker);
            let bucket = gen.bucket_for(&self.pool, hash);
            if let Some(None) = self.lookup(off, bucket, key) {
                return Ok(false);
            }
            match bucket.lock.lock() {
                Acquire::Locked => {}
                Acquire::Resizing => {
                    self.help_resize(off, gen, bucket);
                    continue;
                }
            }
            let updated = self.update_locked(bucket, key, val);
            bucket.lock.unlock();
            return updated;
        }
    }

    fn update_locked(&self, bucket: &Bucket, key: Key, val: Value) -> Result<bool> {
        for b in bucket.chain(&self.pool) {
            if let Some(j) = b.slots.position(key) {
                b.slots.val(j).store(val, Ordering::Release);
                self.pool.persist(FlushPoint::SlotUpdate, b.slots.val(j))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn help_resize(&self, off: POff<Generation>, gen: &Generation, bucket: &Bucket) {
        // keeps an abandoned target allocated while we look at it
        gen.helping.fetch_add(1, Ordering::SeqCst);
        let target = gen.tmp.load(Ordering::SeqCst);
        if !target.is_null() {
            let target = self.pool.get(target);
            if let Some(_helper) = target.migration.enter(self.config.resize_helpers) {
                let old = gen.buckets(&self.pool);
                while let Some(i) = target.migration.claim_one() {
                    match self.migrate(&old[i], target) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            log::warn!("helper failed to migrate bucket {}: {}", i, e);
                            self.fail_resize(target, e);
                            break;
                        }
                    }
                }
            }
        }
        gen.helping.fetch_sub(1, Ordering::SeqCst);

        let backoff = Backoff::new();
        while bucket.lock.is_resizing() && self.root().current.load(Ordering::SeqCst) == off {
            backoff.snooze();
        }
    }

    fn migrate(&self, bucket: &Bucket, target: &Generation) -> Result<bool> {
        if !bucket.lock.lock_for_resize() {
            return Ok(false);
        }
        for b in bucket.chain(&self.pool) {
            for (key, val) in b.slots.entries() {
                let dest = target.bucket_for(&self.pool, jenkins64(key));
                if layout::insert_unique(&self.pool, dest, key, val)? == Inserted::Overflow {
                    target.expanded();
                }
            }
        }
        Ok(true)
    }

    fn migrate_all(&self, old: &Generation, new: &Generation) -> Result<()> {
        self.pool.persist(FlushPoint::Generation, &old.tmp)?;
        for b in old.buckets(&self.pool) {
            if !self.migrate(b, new)? {
                break;
            }
        }
        Ok(())
    }

    /// Flushes a migrated generation and links it behind the one it replaces.
    fn prepare_install(
        &self,
        old_off: POff<Generation>,
        old: &Generation,
        new_off: POff<Generation>,
        new: &Generation,
    ) -> Result<()> {
        persist_generation(&self.pool, new, FlushPoint::Generation)?;
        new.prev.store(old_off, Ordering::SeqCst);
        self.pool.persist(FlushPoint::Generation, &new.prev)?;
        old.next.store(new_off, Ordering::SeqCst);
        self.pool.persist(FlushPoint::Generation, &old.next)
    }

    fn fail_resize(&self, target: &Generation, e: Error) {
        let mut slot = self.resize_error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
        target.migration.abandon();
    }

    /// Gives the old buckets back to writers and frees the target of a failed resize.
    fn discard(&self, old: &Generation, target: POff<Generation>) -> Result<()> {
        for b in old.buckets(&self.pool) {
            b.lock.thaw();
        }
        old.next.store(POff::NULL, Ordering::SeqCst);
        old.tmp.store(POff::NULL, Ordering::SeqCst);
        self.pool.persist(FlushPoint::Generation, &old.tmp)?;
        let backoff = Backoff::new();
        while old.helping.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
        // safety: unlinked, and every helper that could have seen it is gone.
        unsafe { free_generation(&self.pool, target) }
    }

    /// Replaces the current generation with a bigger or smaller one.
    ///
    /// Returns `Ok(false)` if another resize is already running or the table cannot move in
    /// that direction. If the pool runs out of space half-way, the attempt is rolled back and
    /// the table stays as it was.
    pub fn resize(&self, direction: ResizeDirection) -> Result<bool> {
        let root = self.root();
        let resize_lock = match root.resize_lock.try_lock() {
            Some(lock) => lock,
            None => return Ok(false),
        };
        // only the holder of the resize lock changes `current`
        let old_off = root.current.load(Ordering::SeqCst);
        let old = self.pool.get(old_off);
        let buckets = match direction.target(old.len(), &self.config) {
            Some(n) => n,
            None => return Ok(false),
        };

        let new_off = alloc_generation(
            &self.pool,
            buckets,
            old.version() + 1,
            self.config.expand_threshold(buckets),
            FlushPoint::Generation,
        )?;
        let new = self.pool.get(new_off);
        new.migration
            .open(old.len(), direction.is_grow() && self.config.resize_helpers > 0);
        log::debug!(
            "resizing from {} to {} buckets (version {})",
            old.len(),
            buckets,
            new.version()
        );
        old.tmp.store(new_off, Ordering::SeqCst);

        if let Err(e) = self.migrate_all(old, new) {
            self.fail_resize(new, e);
        }
        new.migration.close();
        if !new.migration.is_abandoned() {
            if let Err(e) = self.prepare_install(old_off, old, new_off, new) {
                self.fail_resize(new, e);
            }
        }
        if new.migration.is_abandoned() {
            let error = self
                .resize_error
                .lock()
                .take()
                .unwrap_or_else(|| Error::Corrupt(String::from("resize abandoned")));
            log::warn!("abandoning resize to {} buckets: {}", buckets, error);
            self.discard(old, new_off)?;
            return Err(error);
        }

        let installed = {
            let _gc = self.hold_gc();
            root.current.swap(new_off, Ordering::SeqCst);
            self.pool
                .persist(FlushPoint::RootSwap, &root.current)
                .and_then(|()| {
                    old.tmp.store(POff::NULL, Ordering::SeqCst);
                    self.pool.persist(FlushPoint::Retire, &old.tmp)
                })
        };
        log::debug!("installed version {} with {} buckets", new.version(), buckets);
        let again = new.expansions() >= new.expand_threshold();
        drop(resize_lock);
        installed?;

        if let Err(e) = self.collect() {
            log::warn!("collecting old generations failed: {}", e);
        }
        if again {
            self.status(true);
        }
        Ok(true)
    }

    /// Checks the fill level of the table and grows or shrinks it if needed, then collects old
    /// generations.
    ///
    /// Returns the number of entries found, or 0 if another status check was already running.
    /// A forced check goes ahead regardless, since it is usually issued from inside one.
    pub fn status(&self, force: bool) -> usize {
        let _lock = match self.root().status_lock.try_lock() {
            Some(lock) => Some(lock),
            None if force => None,
            None => return 0,
        };
        let occupancy = self.with_current(|gen| gen.occupancy(&self.pool));
        if let Some(direction) = occupancy.decide(&self.config, force) {
            if let Err(e) = self.resize(direction) {
                log::warn!("{:?} failed: {}", direction, e);
            }
        }
        if let Err(e) = self.collect() {
            log::warn!("collecting old generations failed: {}", e);
        }
        occupancy.size
    }

    fn collect(&self) -> Result<usize> {
        let root = self.root();
        let _lock = match root.gc_lock.try_lock() {
            Some(lock) => lock,
            None => return Ok(0),
        };
        let current = self.pool.get(root.current.load(Ordering::SeqCst));
        let min = self.registry.min_watermark(current.version());
        if min <= root.version_min.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.reclaim(min)
    }

    /// Frees every old generation with a version below `min`. The GC lock must be held.
    fn reclaim(&self, min: u64) -> Result<usize> {
        let root = self.root();
        let mut freed = 0;
        loop {
            let off = root.oldest.load(Ordering::SeqCst);
            let gen = self.pool.get(off);
            let next = gen.next.load(Ordering::SeqCst);
            if gen.version() >= min || next.is_null() {
                break;
            }
            let successor = self.pool.get(next);
            successor.prev.store(POff::NULL, Ordering::SeqCst);
            self.pool.persist(FlushPoint::Reclaim, &successor.prev)?;
            root.oldest.store(next, Ordering::SeqCst);
            self.pool.persist(FlushPoint::Reclaim, &root.oldest)?;
            // safety: no longer reachable from the root, and below every worker's watermark.
            unsafe { free_generation(&self.pool, off)? };
            freed += 1;
        }
        let oldest = self.pool.get(root.oldest.load(Ordering::SeqCst));
        root.version_min.store(oldest.version(), Ordering::SeqCst);
        self.pool.persist(FlushPoint::Reclaim, &root.version_min)?;
        if freed > 0 {
            log::debug!("freed {} old generations", freed);
        }
        Ok(freed)
    }

    /// Frees old generations that no registered worker can still be using.
    /// Returns the number of generations freed.
    pub fn gc_collect(&self) -> Result<usize> {
        self.collect()
    }

    /// Frees all old generations, ignoring worker watermarks.
    pub fn gc_collect_all(&mut self) -> Result<usize> {
        self.reclaim(u64::MAX)
    }

    /// Releases every bucket and table lock, including those left behind by a crash.
    pub fn lock_reinitialize(&mut self) {
        let root = self.root();
        root.reset_locks();
        let gen = self.pool.get(root.current.load(Ordering::SeqCst));
        let mut released = 0;
        for b in gen.buckets(&self.pool) {
            if b.lock.state() != LockState::Free {
                released += 1;
            }
            b.lock.reset();
        }
        if released > 0 {
            log::info!("released {} bucket locks", released);
        }
    }

    /// Number of buckets of the current generation whose lock is not free.
    pub fn held_locks(&self) -> usize {
        self.with_current(|gen| {
            gen.buckets(&self.pool)
                .iter()
                .filter(|b| b.lock.state() != LockState::Free)
                .count()
        })
    }

    /// Number of entries in the current generation.
    pub fn size(&self) -> usize {
        self.with_current(|gen| gen.size(&self.pool))
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bytes used by the buckets of the current generation, overflow buckets included.
    pub fn size_in_bytes(&self) -> usize {
        self.with_current(|gen| gen.footprint(&self.pool))
    }

    /// Bytes held by old generations that have not been collected yet.
    pub fn size_of_garbage(&self) -> usize {
        let _gc = self.hold_gc();
        let root = self.root();
        let mut bytes = 0;
        let mut off = root.oldest.load(Ordering::SeqCst);
        while off != root.current.load(Ordering::SeqCst) {
            let gen = self.pool.get(off);
            bytes += gen.footprint(&self.pool);
            off = gen.next.load(Ordering::SeqCst);
        }
        bytes
    }

    /// Number of primary buckets in the current generation.
    pub fn bucket_count(&self) -> usize {
        self.with_current(|gen| gen.len())
    }

    /// Version of the current generation. Survives restarts.
    pub fn version(&self) -> u64 {
        self.with_current(|gen| gen.version())
    }

    /// Number of generations still allocated, the current one included.
    pub fn generations(&self) -> usize {
        let _gc = self.hold_gc();
        let root = self.root();
        let mut n = 1;
        let mut off = root.oldest.load(Ordering::SeqCst);
        while off != root.current.load(Ordering::SeqCst) {
            n += 1;
            off = self.pool.get(off).next.load(Ordering::SeqCst);
        }
        n
    }

    /// Size of the pool file.
    pub fn pool_size(&self) -> u64 {
        self.pool.len()
    }

    /// Bytes of the pool that have never been allocated.
    pub fn pool_available(&self) -> u64 {
        self.pool.available()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for PersistentTable {
    fn drop(&mut self) {
        if let Err(e) = self.pool.sync_all() {
            log::warn!("failed to write the pool back on close: {}", e);
        }
    }
}

impl fmt::Debug for PersistentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentTable")
            .field("buckets", &self.bucket_count())
            .field("version", &self.version())
            .field("pool", &self.pool)
            .field("workers", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &tempfile::TempDir) -> PoolOptions {
        PoolOptions::new(dir.path().join("t.pool"))
            .size(4 << 20)
            .persister(NoFlush)
    }

    #[test]
    fn basics() {
        let dir = tempfile::tempdir().unwrap();
        let t = options(&dir).open().unwrap();
        let w = t.register(0);
        assert!(t.is_empty());
        assert!(t.put(1, 10, &w).unwrap());
        assert!(!t.put(1, 11, &w).unwrap());
        assert_eq!(t.get(1, &w), Some(10));
        assert!(t.update(1, 12, &w).unwrap());
        assert!(!t.update(2, 12, &w).unwrap());
        assert_eq!(t.get(1, &w), Some(12));
        assert_eq!(t.remove(1, &w).unwrap(), Some(12));
        assert_eq!(t.remove(1, &w).unwrap(), None);
        assert_eq!(t.get(0, &w), None);
        assert!(t.is_empty());
        assert_eq!(t.bucket_count(), 8);
        assert_eq!(t.version(), 0);
        assert_eq!(t.held_locks(), 0);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let t = options(&dir).open().unwrap();
            let w = t.register(0);
            for k in 1..=500 {
                assert!(t.put(k, k + 1, &w).unwrap());
            }
            assert!(t.version() > 0);
        }
        let t = options(&dir).open().unwrap();
        let w = t.register(0);
        assert_eq!(t.size(), 500);
        for k in 1..=500 {
            assert_eq!(t.get(k, &w), Some(k + 1));
        }
        // replaced generations were freed on reopen
        assert_eq!(t.generations(), 1);
        assert_eq!(t.size_of_garbage(), 0);
    }

    #[test]
    fn resize_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let t = options(&dir).open().unwrap();
        let w = t.register(0);
        for k in 1..=20 {
            t.put(k, k, &w).unwrap();
        }
        let (v, n) = (t.version(), t.bucket_count());
        assert!(t.resize(ResizeDirection::Grow { factor: 4 }).unwrap());
        assert_eq!(t.bucket_count(), n * 4);
        assert_eq!(t.version(), v + 1);
        // still pinned by the worker
        assert!(t.generations() >= 2);
        assert!(t.size_of_garbage() > 0);
        w.quiesce();
        assert!(t.gc_collect().unwrap() >= 1);
        assert_eq!(t.generations(), 1);
        assert_eq!(t.size_of_garbage(), 0);
        for k in 1..=20 {
            assert_eq!(t.get(k, &w), Some(k));
        }
        assert!(t.resize(ResizeDirection::Shrink).unwrap());
        assert!(t.bucket_count() < n * 4);
        assert_eq!(t.size(), 20);
        for k in 1..=20 {
            assert_eq!(t.get(k, &w), Some(k));
        }
    }

    #[test]
    fn collect_all_ignores_watermarks() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = options(&dir).open().unwrap();
        let w = t.register(0);
        t.put(1, 1, &w).unwrap();
        t.resize(ResizeDirection::Grow { factor: 2 }).unwrap();
        t.resize(ResizeDirection::Grow { factor: 2 }).unwrap();
        assert_eq!(t.generations(), 3);
        drop(w);
        assert_eq!(t.gc_collect_all().unwrap(), 2);
        assert_eq!(t.generations(), 1);
    }

    #[test]
    fn failed_resize_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        // room for the first generation and a few overflow buckets, not for 8192 buckets
        let t = options(&dir).size(64 << 10).open().unwrap();
        let w = t.register(0);
        for k in 1..=10 {
            t.put(k, k, &w).unwrap();
        }
        let before = t.pool_available();
        assert!(matches!(
            t.resize(ResizeDirection::Grow { factor: 1024 }),
            Err(Error::PoolExhausted { .. })
        ));
        assert_eq!(t.pool_available(), before);
        assert_eq!(t.bucket_count(), 8);
        assert_eq!(t.held_locks(), 0);
        for k in 1..=10 {
            assert_eq!(t.get(k, &w), Some(k));
        }
        assert!(t.put(11, 11, &w).unwrap());
    }

    #[test]
    fn not_a_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0xab; 8192]).unwrap();
        assert!(matches!(
            PoolOptions::new(&path).open(),
            Err(Error::Corrupt(_))
        ));
    }
}
