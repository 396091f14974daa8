use crate::generation::BucketStats;
use crate::{Key, Value, ENTRIES_PER_BUCKET};
use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one slot, as recorded in the bucket's snapshot word.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Invalid = 0,
    Valid = 1,
    /// Reserved by an insert that is still writing the key and value.
    Inserting = 2,
}

const FROZEN: u64 = 1 << 24;
const VERSION_SHIFT: u32 = 32;

/// A bucket's snapshot word: one state byte per slot, a frozen bit, and a 32-bit version that
/// changes whenever a slot becomes valid or invalid.
///
/// Any change to the bucket changes the word, so a reader that sees the same word before and
/// after reading the slots has read a consistent bucket.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot(u64);

impl Snapshot {
    #[inline]
    pub(crate) fn state(self, j: usize) -> SlotState {
        match (self.0 >> (8 * j)) as u8 {
            0 => SlotState::Invalid,
            1 => SlotState::Valid,
            2 => SlotState::Inserting,
            s => unreachable!("unknown slot state {}", s),
        }
    }

    #[inline]
    #[must_use]
    fn with(self, j: usize, state: SlotState) -> Self {
        let shift = 8 * j;
        Snapshot((self.0 & !(0xff << shift)) | ((state as u64) << shift))
    }

    #[inline]
    #[must_use]
    fn bumped(self) -> Self {
        let version = self.version().wrapping_add(1);
        Snapshot((self.0 & ((1 << VERSION_SHIFT) - 1)) | (u64::from(version) << VERSION_SHIFT))
    }

    #[inline]
    pub(crate) fn version(self) -> u32 {
        (self.0 >> VERSION_SHIFT) as u32
    }

    #[inline]
    pub(crate) fn is_frozen(self) -> bool {
        self.0 & FROZEN != 0
    }

    #[inline]
    fn free_slot(self) -> Option<usize> {
        (0..ENTRIES_PER_BUCKET).find(|&j| self.state(j) == SlotState::Invalid)
    }

    #[inline]
    fn has_inserting(self) -> bool {
        (0..ENTRIES_PER_BUCKET).any(|j| self.state(j) == SlotState::Inserting)
    }

    fn valid(self) -> impl Iterator<Item = usize> {
        (0..ENTRIES_PER_BUCKET).filter(move |&j| self.state(j) == SlotState::Valid)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("slots", &[self.state(0), self.state(1), self.state(2)])
            .field("frozen", &self.is_frozen())
            .field("version", &self.version())
            .finish()
    }
}

/// Outcome of [`Bucket::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Insert {
    Inserted,
    Duplicate,
    /// The bucket is being migrated. Any slot the insert had reserved was released.
    Frozen,
    /// No free slot was seen in this many consecutive reads.
    Full,
}

/// Outcome of [`Bucket::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Remove {
    Removed(Value),
    Absent,
    Frozen,
}

/// A lock-free bucket: a snapshot word and three slots in one cache line, with no overflow.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    snapshot: AtomicU64,
    keys: [AtomicU64; ENTRIES_PER_BUCKET],
    vals: [AtomicU64; ENTRIES_PER_BUCKET],
}

const _: () = assert!(std::mem::size_of::<Bucket>() == 64);

impl Bucket {
    #[inline]
    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.snapshot.load(Ordering::Acquire))
    }

    #[inline]
    fn cas(&self, current: Snapshot, new: Snapshot) -> Result<(), Snapshot> {
        self.snapshot
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Snapshot)
    }

    /// Finds `key` among the slots that are valid in `s`.
    #[inline]
    fn scan(&self, s: Snapshot, key: Key) -> Option<usize> {
        s.valid()
            .find(|&j| self.keys[j].load(Ordering::Relaxed) == key)
    }

    /// Looks `key` up. Also returns the snapshot the answer is consistent with.
    pub(crate) fn find(&self, key: Key) -> (Option<Value>, Snapshot) {
        loop {
            let s = self.load();
            let found = self
                .scan(s, key)
                .map(|j| self.vals[j].load(Ordering::Relaxed));
            let after = self.load();
            if after == s {
                return (found, s);
            }
        }
    }

    /// Inserts `key` unless it is already present.
    ///
    /// A free slot is first reserved by moving it to [`SlotState::Inserting`], then filled, and
    /// finally published by moving it to [`SlotState::Valid`]. The final step only succeeds if
    /// nothing else changed in the bucket since the duplicate check, so two inserts of the same
    /// key can never both publish.
    pub(crate) fn insert(&self, key: Key, val: Value, tries: usize) -> Insert {
        let backoff = Backoff::new();
        let mut reserved = None;
        let mut full = 0;
        loop {
            let s = self.load();
            if s.is_frozen() {
                if let Some(j) = reserved {
                    self.release(j);
                }
                return Insert::Frozen;
            }
            if self.scan(s, key).is_some() {
                if let Some(j) = reserved {
                    self.release(j);
                }
                return Insert::Duplicate;
            }

            match reserved {
                Some(j) => {
                    debug_assert_eq!(s.state(j), SlotState::Inserting);
                    if self.cas(s, s.with(j, SlotState::Valid).bumped()).is_ok() {
                        return Insert::Inserted;
                    }
                }
                None => match s.free_slot() {
                    Some(j) => {
                        if self.cas(s, s.with(j, SlotState::Inserting)).is_ok() {
                            self.vals[j].store(val, Ordering::Relaxed);
                            self.keys[j].store(key, Ordering::Relaxed);
                            reserved = Some(j);
                        }
                    }
                    None => {
                        full += 1;
                        if full >= tries {
                            return Insert::Full;
                        }
                        backoff.spin();
                    }
                },
            }
        }
    }

    /// Gives up a reserved slot. Allowed while frozen, so that a migration waiting for reserved
    /// slots to drain can make progress.
    fn release(&self, j: usize) {
        let mut s = self.load();
        loop {
            debug_assert_eq!(s.state(j), SlotState::Inserting);
            match self.cas(s, s.with(j, SlotState::Invalid)) {
                Ok(()) => return,
                Err(now) => s = now,
            }
        }
    }

    pub(crate) fn remove(&self, key: Key) -> Remove {
        loop {
            let s = self.load();
            if s.is_frozen() {
                return Remove::Frozen;
            }
            match self.scan(s, key) {
                Some(j) => {
                    let val = self.vals[j].load(Ordering::Relaxed);
                    if self.cas(s, s.with(j, SlotState::Invalid).bumped()).is_ok() {
                        return Remove::Removed(val);
                    }
                }
                None => {
                    if self.load() == s {
                        return Remove::Absent;
                    }
                }
            }
        }
    }

    /// Stops all further changes to the bucket and waits for reserved slots to be published or
    /// released. Returns the final snapshot.
    pub(crate) fn freeze(&self) -> Snapshot {
        let mut s = self.load();
        while !s.is_frozen() {
            match self.cas(s, Snapshot(s.0 | FROZEN)) {
                Ok(()) => break,
                Err(now) => s = now,
            }
        }
        let backoff = Backoff::new();
        loop {
            let s = self.load();
            if !s.has_inserting() {
                return s;
            }
            backoff.snooze();
        }
    }

    pub(crate) fn thaw(&self) {
        let mut s = self.load();
        while s.is_frozen() {
            match self.cas(s, Snapshot(s.0 & !FROZEN)) {
                Ok(()) => return,
                Err(now) => s = now,
            }
        }
    }

    /// The entries that are valid in `s`.
    pub(crate) fn entries(&self, s: Snapshot) -> impl Iterator<Item = (Key, Value)> + '_ {
        s.valid().map(move |j| {
            (
                self.keys[j].load(Ordering::Relaxed),
                self.vals[j].load(Ordering::Relaxed),
            )
        })
    }

    /// Stores an entry into a bucket nobody else is writing to. Returns `false` if it is full.
    pub(crate) fn insert_unique(&self, key: Key, val: Value) -> bool {
        let s = self.load();
        match s.free_slot() {
            Some(j) => {
                self.vals[j].store(val, Ordering::Relaxed);
                self.keys[j].store(key, Ordering::Relaxed);
                self.snapshot
                    .store(s.with(j, SlotState::Valid).bumped().0, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

impl BucketStats for Bucket {
    fn stats(&self) -> (usize, usize) {
        (self.load().valid().count(), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_bits() {
        let s = Snapshot(0);
        assert_eq!(s.free_slot(), Some(0));
        let s = s.with(0, SlotState::Valid).with(2, SlotState::Inserting);
        assert_eq!(s.state(0), SlotState::Valid);
        assert_eq!(s.state(1), SlotState::Invalid);
        assert_eq!(s.state(2), SlotState::Inserting);
        assert!(s.has_inserting());
        assert_eq!(s.free_slot(), Some(1));
        assert_eq!(s.valid().collect::<Vec<_>>(), vec![0]);

        let v = Snapshot(u64::from(u32::MAX) << VERSION_SHIFT).bumped();
        assert_eq!(v.version(), 0);
        assert_eq!(s.bumped().version(), 1);
        assert_eq!(s.bumped().state(2), SlotState::Inserting);
        assert!(Snapshot(s.0 | FROZEN).is_frozen());
    }

    #[test]
    fn insert_find_remove() {
        let b = Bucket::default();
        assert_eq!(b.insert(1, 10, 16), Insert::Inserted);
        assert_eq!(b.insert(1, 11, 16), Insert::Duplicate);
        assert_eq!(b.insert(2, 20, 16), Insert::Inserted);
        assert_eq!(b.insert(3, 30, 16), Insert::Inserted);
        assert_eq!(b.insert(4, 40, 16), Insert::Full);
        assert_eq!(b.find(2).0, Some(20));
        assert_eq!(b.find(4).0, None);
        assert_eq!(b.remove(2), Remove::Removed(20));
        assert_eq!(b.remove(2), Remove::Absent);
        assert_eq!(b.insert(4, 40, 16), Insert::Inserted);
        assert_eq!(b.stats(), (3, 1));
    }

    #[test]
    fn frozen_buckets_refuse_changes() {
        let b = Bucket::default();
        assert_eq!(b.insert(1, 10, 16), Insert::Inserted);
        let s = b.freeze();
        assert!(s.is_frozen());
        assert_eq!(b.insert(2, 20, 16), Insert::Frozen);
        assert_eq!(b.remove(1), Remove::Frozen);
        // reads still work
        assert_eq!(b.find(1).0, Some(10));
        assert_eq!(b.entries(s).collect::<Vec<_>>(), vec![(1, 10)]);
        b.thaw();
        assert_eq!(b.insert(2, 20, 16), Insert::Inserted);
    }

    #[test]
    fn concurrent_same_key() {
        for _ in 0..100 {
            let b = Arc::new(Bucket::default());
            let threads: Vec<_> = (0..3)
                .map(|i| {
                    let b = Arc::clone(&b);
                    std::thread::spawn(move || b.insert(42, i, 16) == Insert::Inserted)
                })
                .collect();
            let wins = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|&won| won)
                .count();
            assert_eq!(wins, 1);
            assert_eq!(b.stats(), (1, 1));
            assert!(!b.load().has_inserting());
        }
    }

    #[test]
    fn unique_inserts_fill_up() {
        let b = Bucket::default();
        assert!(b.insert_unique(1, 1));
        assert!(b.insert_unique(2, 2));
        assert!(b.insert_unique(3, 3));
        assert!(!b.insert_unique(4, 4));
        assert_eq!(b.find(3).0, Some(3));
    }
}
