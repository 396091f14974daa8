use crate::generation::BucketStats;
use crate::lock::BucketLock;
use crate::{Key, Value, ENTRIES_PER_BUCKET};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// The key/value slots of one bucket.
///
/// A key of `0` marks an empty slot. Writers always store the value before the key, so a reader
/// that sees a key also sees (at least) the value that was stored with it.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Slots {
    keys: [AtomicU64; ENTRIES_PER_BUCKET],
    vals: [AtomicU64; ENTRIES_PER_BUCKET],
}

impl Slots {
    /// Reads the value of slot `j` if it holds `key`.
    ///
    /// The value is read on both sides of the key so that a concurrent overwrite of the slot is
    /// never observed half-way: if the two reads disagree, the slot is read again.
    #[inline]
    pub(crate) fn read(&self, j: usize, key: Key) -> Option<Value> {
        loop {
            let val = self.vals[j].load(Ordering::Acquire);
            if self.keys[j].load(Ordering::Acquire) != key {
                return None;
            }
            if self.vals[j].load(Ordering::Acquire) == val {
                return Some(val);
            }
        }
    }

    #[inline]
    pub(crate) fn find(&self, key: Key) -> Option<Value> {
        (0..ENTRIES_PER_BUCKET).find_map(|j| self.read(j, key))
    }

    /// Index of the slot holding `key`. Only meaningful while the bucket lock is held.
    #[inline]
    pub(crate) fn position(&self, key: Key) -> Option<usize> {
        (0..ENTRIES_PER_BUCKET).find(|&j| self.keys[j].load(Ordering::Relaxed) == key)
    }

    #[inline]
    pub(crate) fn empty(&self) -> Option<usize> {
        self.position(0)
    }

    #[inline]
    pub(crate) fn key(&self, j: usize) -> &AtomicU64 {
        &self.keys[j]
    }

    #[inline]
    pub(crate) fn val(&self, j: usize) -> &AtomicU64 {
        &self.vals[j]
    }

    /// Stores a value and then its key.
    #[inline]
    pub(crate) fn store(&self, j: usize, key: Key, val: Value) {
        self.vals[j].store(val, Ordering::Release);
        self.keys[j].store(key, Ordering::Release);
    }

    /// The live entries. Only stable while the bucket is locked or frozen.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (Key, Value)> + '_ {
        (0..ENTRIES_PER_BUCKET).filter_map(move |j| {
            let key = self.keys[j].load(Ordering::Acquire);
            if key == 0 {
                None
            } else {
                Some((key, self.vals[j].load(Ordering::Acquire)))
            }
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.keys
            .iter()
            .filter(|k| k.load(Ordering::Relaxed) != 0)
            .count()
    }
}

/// Outcome of inserting into a locked bucket chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Inserted {
    Duplicate,
    /// Stored in an existing slot.
    Slot,
    /// Stored in a freshly appended overflow bucket.
    Overflow,
}

/// A cache line holding three entries, the bucket lock, and a link to the next overflow bucket.
///
/// Only the lock of a primary bucket is ever taken; it covers the whole chain. Overflow buckets
/// are owned by their chain and freed with it.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    pub(crate) lock: BucketLock,
    pub(crate) slots: Slots,
    next: AtomicPtr<Bucket>,
}

const _: () = assert!(std::mem::size_of::<Bucket>() == 64);

impl Bucket {
    #[inline]
    pub(crate) fn next(&self) -> Option<&Bucket> {
        // safety: overflow buckets are only freed together with the primary bucket, which the
        // caller is borrowing.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }

    pub(crate) fn chain(&self) -> impl Iterator<Item = &Bucket> + '_ {
        let mut b = Some(self);
        std::iter::from_fn(move || {
            let this = b?;
            b = this.next();
            Some(this)
        })
    }

    /// Lock-free lookup through the whole chain.
    #[inline]
    pub(crate) fn find(&self, key: Key) -> Option<Value> {
        self.chain().find_map(|b| b.slots.find(key))
    }

    /// Inserts `key` unless it is already present. The bucket lock must be held.
    pub(crate) fn insert_locked(&self, key: Key, val: Value) -> Inserted {
        let mut empty = None;
        let mut last = self;
        for b in self.chain() {
            if b.slots.position(key).is_some() {
                return Inserted::Duplicate;
            }
            if empty.is_none() {
                empty = b.slots.empty().map(|j| (b, j));
            }
            last = b;
        }

        if let Some((b, j)) = empty {
            b.slots.store(j, key, val);
            Inserted::Slot
        } else {
            last.append(key, val);
            Inserted::Overflow
        }
    }

    /// Removes `key` and returns its value. The bucket lock must be held.
    pub(crate) fn remove_locked(&self, key: Key) -> Option<Value> {
        for b in self.chain() {
            if let Some(j) = b.slots.position(key) {
                let val = b.slots.val(j).load(Ordering::Relaxed);
                b.slots.key(j).store(0, Ordering::Release);
                return Some(val);
            }
        }
        None
    }

    /// Inserts without looking for duplicates. Used while migrating into a generation that is not
    /// yet visible to anyone but the migrators, who never share a target bucket.
    ///
    /// Returns `true` if an overflow bucket had to be appended.
    pub(crate) fn insert_unique(&self, key: Key, val: Value) -> bool {
        let mut last = self;
        for b in self.chain() {
            if let Some(j) = b.slots.empty() {
                b.slots.store(j, key, val);
                return false;
            }
            last = b;
        }
        last.append(key, val);
        true
    }

    fn append(&self, key: Key, val: Value) {
        debug_assert!(self.next.load(Ordering::Relaxed).is_null());
        let b = Bucket::default();
        b.slots.store(0, key, val);
        self.next
            .store(Box::into_raw(Box::new(b)), Ordering::Release);
    }
}

impl BucketStats for Bucket {
    fn stats(&self) -> (usize, usize) {
        self.chain()
            .fold((0, 0), |(entries, depth), b| (entries + b.slots.len(), depth + 1))
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        let mut next = std::mem::replace(self.next.get_mut(), ptr::null_mut());
        while !next.is_null() {
            // safety: we own the chain, and nobody can reach it once the primary bucket is
            // being dropped.
            let mut b = unsafe { Box::from_raw(next) };
            next = std::mem::replace(b.next.get_mut(), ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_find_remove() {
        let b = Bucket::default();
        assert_eq!(b.insert_locked(1, 10), Inserted::Slot);
        assert_eq!(b.insert_locked(2, 20), Inserted::Slot);
        assert_eq!(b.insert_locked(1, 11), Inserted::Duplicate);
        assert_eq!(b.find(1), Some(10));
        assert_eq!(b.find(3), None);
        assert_eq!(b.remove_locked(1), Some(10));
        assert_eq!(b.find(1), None);
        assert_eq!(b.remove_locked(1), None);
    }

    #[test]
    fn overflow_chain() {
        let b = Bucket::default();
        for k in 1..=3 {
            assert_eq!(b.insert_locked(k, k * 10), Inserted::Slot);
        }
        assert_eq!(b.insert_locked(4, 40), Inserted::Overflow);
        assert_eq!(b.insert_locked(5, 50), Inserted::Slot);
        assert_eq!(b.stats(), (5, 2));
        assert_eq!(b.find(5), Some(50));

        // a freed slot in the primary bucket is reused before the chain grows
        assert_eq!(b.remove_locked(2), Some(20));
        assert_eq!(b.insert_locked(7, 70), Inserted::Slot);
        assert_eq!(b.slots.find(7), Some(70));
        // and duplicates are found anywhere in the chain
        assert_eq!(b.insert_locked(4, 41), Inserted::Duplicate);
    }

    #[test]
    fn unique_inserts() {
        let b = Bucket::default();
        let mut expanded = 0;
        for k in 1..=7 {
            if b.insert_unique(k, k) {
                expanded += 1;
            }
        }
        assert_eq!(expanded, 2);
        assert_eq!(b.stats(), (7, 3));
        let mut all: Vec<_> = b.chain().flat_map(|b| b.slots.entries()).collect();
        all.sort();
        assert_eq!(all, (1..=7).map(|k| (k, k)).collect::<Vec<_>>());
    }
}
