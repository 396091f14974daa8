use crate::error::{Error, Result};
use crate::gc::{Registry, Worker};
use crate::lock::TryLock;
use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use crate::resize::{Migration, Occupancy};
use crate::BUCKET_SIZE;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-bucket numbers needed by status scans and memory accounting.
pub(crate) trait BucketStats: Default + Send + Sync {
    /// Live entries in the bucket and the length of its chain (at least 1).
    fn stats(&self) -> (usize, usize);
}

/// One fixed-size array of buckets, plus the links that tie it to the generations before and
/// after it.
pub(crate) struct Generation<B> {
    buckets: Box<[B]>,
    mask: u64,
    pub(crate) version: u64,
    expansions: AtomicUsize,
    pub(crate) expand_threshold: usize,
    /// The generation that replaced this one. Set right before the swap that retires this one.
    pub(crate) next: Atomic<Generation<B>>,
    /// The generation this one replaced, until the collector frees it.
    pub(crate) prev: Atomic<Generation<B>>,
    /// The resize target while a resize out of this generation is running.
    pub(crate) tmp: Atomic<Generation<B>>,
    /// State of the migration *into* this generation.
    pub(crate) migration: Migration,
}

impl<B: BucketStats> Generation<B> {
    /// Allocates a generation of `buckets` empty buckets.
    ///
    /// Reports allocation failure instead of aborting, since a failed grow should leave the table
    /// usable.
    pub(crate) fn try_new(buckets: usize, version: u64, expand_threshold: usize) -> Result<Self> {
        debug_assert!(buckets.is_power_of_two());
        let mut v = Vec::new();
        v.try_reserve_exact(buckets)
            .map_err(|_| Error::Allocation { buckets })?;
        v.resize_with(buckets, B::default);
        Ok(Generation {
            buckets: v.into_boxed_slice(),
            mask: buckets as u64 - 1,
            version,
            expansions: AtomicUsize::new(0),
            expand_threshold,
            next: Atomic::null(),
            prev: Atomic::null(),
            tmp: Atomic::null(),
            migration: Migration::default(),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bin(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    #[inline]
    pub(crate) fn bucket(&self, i: usize) -> &B {
        &self.buckets[i]
    }

    #[inline]
    pub(crate) fn bucket_for(&self, hash: u64) -> &B {
        &self.buckets[self.bin(hash)]
    }

    pub(crate) fn buckets(&self) -> &[B] {
        &self.buckets
    }

    /// Counts a new overflow bucket and returns the new total.
    #[inline]
    pub(crate) fn expanded(&self) -> usize {
        self.expansions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn expansions(&self) -> usize {
        self.expansions.load(Ordering::Relaxed)
    }

    pub(crate) fn occupancy(&self) -> Occupancy {
        let mut occ = Occupancy::default();
        for b in self.buckets.iter() {
            let (entries, depth) = b.stats();
            occ.add_bucket(entries, depth);
        }
        occ
    }

    pub(crate) fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.stats().0).sum()
    }

    pub(crate) fn footprint(&self) -> usize {
        self.buckets.iter().map(|b| b.stats().1).sum::<usize>() * BUCKET_SIZE
    }
}

/// The generations of one table, oldest to current, together with the machinery that frees the
/// ones nobody can see anymore.
pub(crate) struct Chain<B> {
    current: Atomic<Generation<B>>,
    oldest: Atomic<Generation<B>>,
    version_min: AtomicU64,
    gc_lock: TryLock,
    pub(crate) collector: Collector,
}

impl<B: BucketStats> Chain<B> {
    pub(crate) fn new(first: Generation<B>) -> Self {
        let collector = Collector::new();
        let version = first.version;
        let first = Shared::boxed(first, &collector);
        Chain {
            current: Atomic::from(first),
            oldest: Atomic::from(first),
            version_min: AtomicU64::new(version),
            gc_lock: TryLock::new(),
            collector,
        }
    }

    #[inline]
    pub(crate) fn current<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Generation<B>> {
        self.current.load(Ordering::SeqCst, guard)
    }

    /// Loads the current generation and publishes its version as `worker`'s watermark.
    #[inline]
    pub(crate) fn pin<'g>(
        &self,
        worker: &Worker,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Generation<B>> {
        let mut gen = self.current(guard);
        loop {
            // safety: current is never null and the guard keeps it alive.
            worker.publish(unsafe { gen.deref() }.version);
            let now = self.current(guard);
            if now == gen {
                return gen;
            }
            gen = now;
        }
    }

    #[inline]
    pub(crate) fn is_current(&self, gen: &Generation<B>, guard: &Guard<'_>) -> bool {
        self.current(guard).is(gen)
    }

    /// Makes `new` the current generation in place of `old`.
    ///
    /// `old.next` is linked before the swap so that the collector, which walks `next` links,
    /// never finds a gap between the oldest and the current generation.
    pub(crate) fn install<'g>(
        &self,
        old: Shared<'g, Generation<B>>,
        new: Shared<'g, Generation<B>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: both generations are protected by the guard.
        let (o, n) = unsafe { (old.deref(), new.deref()) };
        n.prev.store(old, Ordering::SeqCst);
        o.next.store(new, Ordering::SeqCst);
        let was = self.current.swap(new, Ordering::SeqCst, guard);
        assert!(was == old, "generation swapped without holding the resize lock");
    }

    /// Frees every generation whose version is below all worker watermarks.
    pub(crate) fn collect(&self, registry: &Registry) -> usize {
        let _lock = match self.gc_lock.try_lock() {
            Some(lock) => lock,
            None => return 0,
        };
        let guard = self.collector.enter();
        // current before the watermarks; see `Registry::min_watermark`
        let current = unsafe { self.current(&guard).deref() }.version;
        let min = registry.min_watermark(current);
        self.free_below(min, &guard)
    }

    /// Frees every generation but the current one, regardless of watermarks.
    ///
    /// Memory stays valid for any thread still inside an operation; such a thread will find the
    /// buckets it is looking at frozen and move on to the current generation.
    pub(crate) fn collect_all(&self) -> usize {
        let _lock = match self.gc_lock.try_lock() {
            Some(lock) => lock,
            None => return 0,
        };
        let guard = self.collector.enter();
        let current = unsafe { self.current(&guard).deref() }.version;
        self.free_below(current, &guard)
    }

    fn free_below(&self, min: u64, guard: &Guard<'_>) -> usize {
        if min <= self.version_min.load(Ordering::Relaxed) {
            return 0;
        }
        let mut freed = 0;
        let mut old = self.oldest.load(Ordering::SeqCst, guard);
        loop {
            // safety: the oldest generation is never null, and we hold the gc lock so nobody else
            // can retire it.
            let gen = unsafe { old.deref() };
            if gen.version >= min {
                break;
            }
            let next = gen.next.load(Ordering::SeqCst, guard);
            assert!(
                !next.is_null(),
                "generation {} is older than the current one but has no successor",
                gen.version
            );
            // safety: as above.
            unsafe { next.deref() }.prev.store(Shared::null(), Ordering::SeqCst);
            self.oldest.store(next, Ordering::SeqCst);
            // safety: the generation is unlinked: current moved past it and so did `oldest`.
            unsafe { guard.retire_shared(old) };
            freed += 1;
            old = next;
        }
        self.version_min.store(min, Ordering::Relaxed);
        if freed > 0 {
            log::trace!("freed {} generations older than version {}", freed, min);
        }
        freed
    }

    /// Number of generations still allocated, the current one included.
    pub(crate) fn generations(&self) -> usize {
        self.walk(|_| ()).0
    }

    /// Bytes held by generations that are no longer current.
    pub(crate) fn garbage(&self) -> usize {
        self.walk(Generation::footprint).1.iter().sum()
    }

    fn walk<T>(&self, mut f: impl FnMut(&Generation<B>) -> T) -> (usize, Vec<T>) {
        let guard = self.collector.enter();
        let current = self.current(&guard);
        let mut out = Vec::new();
        let mut n = 1;
        let mut g = self.oldest.load(Ordering::SeqCst, &guard);
        while !g.is_null() && g != current {
            // safety: protected by the guard.
            let gen = unsafe { g.deref() };
            out.push(f(gen));
            n += 1;
            g = gen.next.load(Ordering::SeqCst, &guard);
        }
        (n, out)
    }

    #[cfg(test)]
    pub(crate) fn version_min(&self) -> u64 {
        self.version_min.load(Ordering::Relaxed)
    }
}

impl<B> Drop for Chain<B> {
    fn drop(&mut self) {
        let guard = self.collector.enter();
        let mut g = self.oldest.load(Ordering::SeqCst, &guard);
        while !g.is_null() {
            // safety: we have `&mut self`, so no operation is running and no generation is
            // reachable from anywhere else. retired generations were unlinked from this chain.
            let gen = unsafe { g.deref() };
            let next = gen.next.load(Ordering::SeqCst, &guard);
            let tmp = gen.tmp.load(Ordering::SeqCst, &guard);
            if next.is_null() && !tmp.is_null() {
                // a resize target that never became current
                drop(unsafe { tmp.into_box() });
            }
            drop(unsafe { g.into_box() });
            g = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::bucket::Bucket;

    fn gen(buckets: usize, version: u64) -> Generation<Bucket> {
        Generation::try_new(buckets, version, buckets).unwrap()
    }

    fn grow(chain: &Chain<Bucket>, buckets: usize) {
        let guard = chain.collector.enter();
        let old = chain.current(&guard);
        let version = unsafe { old.deref() }.version + 1;
        let new = Shared::boxed(gen(buckets, version), &chain.collector);
        chain.install(old, new, &guard);
    }

    #[test]
    fn generation_basics() {
        let g = gen(8, 1);
        assert_eq!(g.len(), 8);
        assert_eq!(g.bin(13), 5);
        assert_eq!(g.occupancy().buckets, 8);
        assert_eq!(g.size(), 0);
        assert_eq!(g.footprint(), 8 * 64);
        assert_eq!(g.expanded(), 1);
        assert_eq!(g.expansions(), 1);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let r = Generation::<Bucket>::try_new(1usize << (usize::BITS - 2), 1, 1);
        assert!(matches!(r, Err(Error::Allocation { .. })));
    }

    #[test]
    fn collect_respects_watermarks() {
        let registry = Registry::new();
        let chain = Chain::new(gen(8, 1));
        let reader = registry.register(0, 0);
        {
            let guard = chain.collector.enter();
            chain.pin(&reader, &guard);
        }
        assert_eq!(reader.watermark(), Some(1));

        grow(&chain, 16);
        grow(&chain, 32);
        assert_eq!(chain.generations(), 3);
        assert_eq!(chain.garbage(), (8 + 16) * 64);

        // the reader still pins version 1
        assert_eq!(chain.collect(&registry), 0);
        assert_eq!(chain.generations(), 3);

        reader.publish(2);
        assert_eq!(chain.collect(&registry), 1);
        assert_eq!(chain.generations(), 2);
        assert_eq!(chain.version_min(), 2);

        reader.quiesce();
        assert_eq!(chain.collect(&registry), 1);
        assert_eq!(chain.generations(), 1);
        assert_eq!(chain.garbage(), 0);
    }

    #[test]
    fn collect_all_ignores_watermarks() {
        let registry = Registry::new();
        let chain = Chain::new(gen(8, 1));
        let reader = registry.register(0, 0);
        reader.publish(1);
        grow(&chain, 16);
        grow(&chain, 32);
        assert_eq!(chain.collect(&registry), 0);
        assert_eq!(chain.collect_all(), 2);
        assert_eq!(chain.generations(), 1);
    }
}
