use crate::config::Config;
use crate::ENTRIES_PER_BUCKET;
use crossbeam_utils::Backoff;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// Minimum number of buckets a lock-free migrator claims at a time.
const MIN_TRANSFER_STRIDE: usize = 16;

/// The largest table any resize will build.
pub(crate) const MAX_BUCKETS: usize = 1 << 30;

/// Which way a resize goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeDirection {
    /// Multiply the bucket count by `factor` (a power of two, at least 2).
    Grow { factor: usize },
    /// Divide the bucket count by the configured halve ratio.
    Shrink,
}

impl ResizeDirection {
    /// The bucket count a resize of a generation with `buckets` buckets produces, or `None` if
    /// the table cannot move in this direction.
    pub(crate) fn target(self, buckets: usize, config: &Config) -> Option<usize> {
        match self {
            ResizeDirection::Grow { factor } => {
                assert!(
                    factor >= 2 && factor.is_power_of_two(),
                    "grow factor must be a power of two of at least 2, got {}",
                    factor
                );
                buckets
                    .checked_mul(factor)
                    .filter(|&n| n <= MAX_BUCKETS)
            }
            ResizeDirection::Shrink => {
                let n = (buckets / config.halve_ratio).max(config.min_buckets);
                if n < buckets {
                    Some(n)
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn is_grow(self) -> bool {
        matches!(self, ResizeDirection::Grow { .. })
    }
}

/// What a status scan found in one generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Occupancy {
    pub(crate) buckets: usize,
    pub(crate) size: usize,
    pub(crate) expansions: usize,
    pub(crate) max_chain: usize,
}

impl Occupancy {
    pub(crate) fn add_bucket(&mut self, entries: usize, depth: usize) {
        self.buckets += 1;
        self.size += entries;
        self.expansions += depth.saturating_sub(1);
        self.max_chain = self.max_chain.max(depth);
    }

    /// Fill level in percent of the primary slots.
    pub(crate) fn full_percent(&self) -> usize {
        if self.buckets == 0 {
            return 0;
        }
        100 * self.size / (self.buckets * ENTRIES_PER_BUCKET)
    }

    /// The resize a status check should start, if any.
    ///
    /// A forced check always grows, even a table sparse enough to shrink.
    pub(crate) fn decide(&self, config: &Config, force: bool) -> Option<ResizeDirection> {
        let full = self.full_percent();
        let grow = || {
            let factor = (full / config.occupancy_after_resize)
                .next_power_of_two()
                .max(2);
            Some(ResizeDirection::Grow { factor })
        };
        // forced checks follow an overflow; shrinking would only overflow again
        if force {
            return grow();
        }
        if full > 0 && full < config.halve_below {
            if ResizeDirection::Shrink
                .target(self.buckets, config)
                .is_some()
            {
                return Some(ResizeDirection::Shrink);
            }
            return None;
        }
        if full > config.grow_above || self.max_chain > config.max_chain {
            return grow();
        }
        None
    }
}

/// Claim a range of buckets per step so that several lock-free migrators don't fight over
/// adjacent cache lines.
pub(crate) fn transfer_stride(buckets: usize) -> usize {
    let ncpu = num_cpus::get();
    if ncpu > 1 {
        (buckets >> 3) / ncpu
    } else {
        buckets
    }
    .max(MIN_TRANSFER_STRIDE)
}

/// Bookkeeping for a migration *into* the generation that owns it.
///
/// Helpers hand out old-bucket indices from the top through `transfer_index`, count themselves in
/// `started`/`done`, and give up when `abandoned` is set. A helper that shows up late for an
/// abandoned attempt only ever sees the abandoned target.
///
/// The layout is fixed since persistent generations embed it.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Migration {
    transfer_index: AtomicIsize,
    helpers: AtomicBool,
    started: AtomicUsize,
    done: AtomicUsize,
    migrated: AtomicUsize,
    abandoned: AtomicBool,
}

impl Migration {
    /// Prepares to migrate `from` old buckets. Must happen before the target is published.
    pub(crate) fn open(&self, from: usize, helpers: bool) {
        self.transfer_index.store(from as isize, Ordering::SeqCst);
        self.helpers.store(helpers, Ordering::SeqCst);
    }

    /// Registers a helper. Returns `None` if helping is not allowed or no longer useful.
    pub(crate) fn enter(&self, max_helpers: usize) -> Option<HelperGuard<'_>> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        let guard = HelperGuard(self);
        if n >= max_helpers
            || !self.helpers.load(Ordering::SeqCst)
            || self.abandoned.load(Ordering::SeqCst)
        {
            return None;
        }
        Some(guard)
    }

    /// Stops new helpers from doing any work and waits for those already at it.
    pub(crate) fn close(&self) {
        self.helpers.store(false, Ordering::SeqCst);
        let backoff = Backoff::new();
        while self.done.load(Ordering::SeqCst) != self.started.load(Ordering::SeqCst) {
            backoff.snooze();
        }
    }

    /// Hands out the next old bucket, counting down from the top.
    pub(crate) fn claim_one(&self) -> Option<usize> {
        let i = self.transfer_index.fetch_sub(1, Ordering::SeqCst);
        if i <= 0 {
            None
        } else {
            Some(i as usize - 1)
        }
    }

    /// Hands out the next range of old buckets, counting down from the top.
    pub(crate) fn claim_range(&self, stride: usize) -> Option<Range<usize>> {
        let mut next = self.transfer_index.load(Ordering::SeqCst);
        loop {
            if next <= 0 {
                return None;
            }
            let lo = next.saturating_sub(stride as isize).max(0);
            match self.transfer_index.compare_exchange_weak(
                next,
                lo,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(lo as usize..next as usize),
                Err(current) => next = current,
            }
        }
    }

    pub(crate) fn migrated(&self, buckets: usize) {
        self.migrated.fetch_add(buckets, Ordering::SeqCst);
    }

    pub(crate) fn migrated_count(&self) -> usize {
        self.migrated.load(Ordering::SeqCst)
    }

    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Forgets any migration state, e.g. one left behind by a crash.
    pub(crate) fn reset(&self) {
        self.transfer_index.store(0, Ordering::SeqCst);
        self.helpers.store(false, Ordering::SeqCst);
        self.started.store(0, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.migrated.store(0, Ordering::SeqCst);
        self.abandoned.store(false, Ordering::SeqCst);
    }
}

/// Marks a helper as done when dropped.
pub(crate) struct HelperGuard<'a>(&'a Migration);

impl Drop for HelperGuard<'_> {
    fn drop(&mut self) {
        self.0.done.fetch_add(1, Ordering::SeqCst);
    }
}
