use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU8, Ordering};

/// The three states of a bucket lock.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockState {
    Free = 0,
    /// Held by a writer for the duration of a single put/remove/update.
    Update = 1,
    /// Held for good by the resizer (or a helper): the bucket has been migrated, or is being
    /// migrated, to the next generation and must not be written again.
    Resize = 2,
}

impl LockState {
    #[inline]
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LockState::Free,
            1 => LockState::Update,
            2 => LockState::Resize,
            _ => unreachable!("bucket lock holds unknown state {}", raw),
        }
    }
}

/// Outcome of [`BucketLock::lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// The caller now holds the lock in [`LockState::Update`].
    Locked,
    /// The bucket belongs to a resize; the caller must help (or wait for) the resize and then
    /// retry against the next generation.
    Resizing,
}

/// Per-bucket tri-state spinlock.
///
/// The lock is a plain byte so that it can live inside a 64-byte bucket (and inside a persistent
/// pool, where it has to be reset after a crash).
#[repr(transparent)]
#[derive(Debug, Default)]
pub(crate) struct BucketLock(AtomicU8);

impl BucketLock {
    pub(crate) const fn new() -> Self {
        BucketLock(AtomicU8::new(LockState::Free as u8))
    }

    #[inline]
    pub(crate) fn state(&self) -> LockState {
        LockState::from_raw(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_resizing(&self) -> bool {
        self.state() == LockState::Resize
    }

    /// Spins until the lock is taken for an update, or until the bucket turns out to be part of a
    /// resize.
    pub(crate) fn lock(&self) -> Acquire {
        let backoff = Backoff::new();
        loop {
            match self.0.compare_exchange_weak(
                LockState::Free as u8,
                LockState::Update as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Acquire::Locked,
                Err(current) => match LockState::from_raw(current) {
                    LockState::Resize => return Acquire::Resizing,
                    // spurious failure or another writer; keep spinning
                    LockState::Free | LockState::Update => backoff.spin(),
                },
            }
        }
    }

    /// Claims the bucket for migration.
    ///
    /// Waits out a writer that currently holds the lock. Returns `false` if the bucket is
    /// already claimed by a resize, which is how the resizer and its helpers detect that they
    /// have met.
    pub(crate) fn lock_for_resize(&self) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.0.compare_exchange_weak(
                LockState::Free as u8,
                LockState::Resize as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => match LockState::from_raw(current) {
                    LockState::Resize => return false,
                    LockState::Free | LockState::Update => backoff.spin(),
                },
            }
        }
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        debug_assert_eq!(self.state(), LockState::Update);
        self.0.store(LockState::Free as u8, Ordering::Release);
    }

    /// Hands a bucket claimed by an abandoned resize back to writers.
    pub(crate) fn thaw(&self) {
        let _ = self.0.compare_exchange(
            LockState::Resize as u8,
            LockState::Free as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Forces the lock back to free regardless of its state.
    ///
    /// Only sound when no other thread can be using the bucket, i.e. while recovering a pool.
    pub(crate) fn reset(&self) {
        self.0.store(LockState::Free as u8, Ordering::Release);
    }
}

/// A non-blocking lock for the table-level resize, status and GC locks.
///
/// Losing a `try_lock` is never an error: it means someone else is already doing the work.
#[repr(transparent)]
#[derive(Debug, Default)]
pub(crate) struct TryLock(AtomicU8);

impl TryLock {
    pub(crate) const fn new() -> Self {
        TryLock(AtomicU8::new(0))
    }

    /// Returns a guard if the lock was free.
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<TryLockGuard<'_>> {
        if self
            .0
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(TryLockGuard(self))
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Releases a [`TryLock`] when dropped.
#[derive(Debug)]
pub(crate) struct TryLockGuard<'a>(&'a TryLock);

impl Drop for TryLockGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(0, Ordering::Release);
    }
}
