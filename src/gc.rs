//! Per-thread version watermarks.
//!
//! Every operation publishes the version of the generation it is about to dereference. A
//! generation may only be handed back to the allocator once its version is below every published
//! watermark, i.e. once no registered worker can still be looking at it.

use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Watermark of a worker that is not inside an operation and does not pin anything.
pub(crate) const IDLE: u64 = u64::MAX;

static NEXT_TABLE_ID: AtomicUsize = AtomicUsize::new(0);

/// Hands out identifiers used to tie a [`Worker`] to the table that registered it.
pub(crate) fn next_table_id() -> usize {
    NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct Record {
    watermark: CachePadded<AtomicU64>,
    thread_id: AtomicUsize,
    active: AtomicBool,
}

struct Node {
    record: Arc<Record>,
    next: *mut Node,
}

/// The set of workers registered with one table.
///
/// Nodes are only ever pushed, never unlinked, so the list can be walked without any protection.
/// A worker that goes away marks its record inactive and a later registration reuses it.
pub(crate) struct Registry {
    head: AtomicPtr<Node>,
}

// safety: nodes are immutable once published and only freed with `&mut self`.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        let mut node = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            // safety: nodes are never freed while the registry is shared.
            let n = unsafe { node.as_ref()? };
            node = n.next;
            Some(&*n.record)
        })
    }

    pub(crate) fn register(&self, table: usize, thread_id: usize) -> Worker {
        let record = self.claim_or_push(thread_id);
        Worker {
            record,
            table,
            inserts: Cell::new(0),
        }
    }

    fn claim_or_push(&self, thread_id: usize) -> Arc<Record> {
        let mut node = self.head.load(Ordering::Acquire);
        // safety: as in `iter`.
        while let Some(n) = unsafe { node.as_ref() } {
            if n
                .record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                n.record.thread_id.store(thread_id, Ordering::Relaxed);
                n.record.watermark.store(IDLE, Ordering::SeqCst);
                return Arc::clone(&n.record);
            }
            node = n.next;
        }

        let record = Arc::new(Record {
            watermark: CachePadded::new(AtomicU64::new(IDLE)),
            thread_id: AtomicUsize::new(thread_id),
            active: AtomicBool::new(true),
        });
        let node = Box::into_raw(Box::new(Node {
            record: Arc::clone(&record),
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // safety: `node` is not yet shared.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return record,
                Err(current) => head = current,
            }
        }
    }

    /// The smallest version any registered worker may still dereference, capped at `current`.
    ///
    /// `current` must have been loaded before calling this. A worker that publishes after its
    /// watermark was read here re-validates against a table whose current version is at least
    /// `current`, so it cannot be pinning anything older.
    pub(crate) fn min_watermark(&self, current: u64) -> u64 {
        self.iter()
            .filter(|r| r.active.load(Ordering::Acquire))
            .map(|r| r.watermark.load(Ordering::SeqCst))
            .fold(current, u64::min)
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.iter()
            .filter(|r| r.active.load(Ordering::Acquire))
            .count()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // safety: we have `&mut self`, so nobody can be walking the list.
            let n = unsafe { Box::from_raw(node) };
            node = n.next;
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.iter()
                    .filter(|r| r.active.load(Ordering::Relaxed))
                    .map(|r| {
                        (
                            r.thread_id.load(Ordering::Relaxed),
                            r.watermark.load(Ordering::Relaxed),
                        )
                    }),
            )
            .finish()
    }
}

/// A thread's handle for operating on one table.
///
/// Obtained from `register` on any of the tables and passed to every operation. The worker
/// records which generation the thread last touched; until it moves on (or calls
/// [`Worker::quiesce`], or is dropped) that generation and every newer one stay allocated.
///
/// A `Worker` may be sent to another thread, but not shared between threads.
pub struct Worker {
    record: Arc<Record>,
    table: usize,
    inserts: Cell<u64>,
}

impl Worker {
    /// The thread identifier this worker was registered with.
    pub fn thread_id(&self) -> usize {
        self.record.thread_id.load(Ordering::Relaxed)
    }

    /// The version this worker currently pins, if any.
    pub fn watermark(&self) -> Option<u64> {
        match self.record.watermark.load(Ordering::Relaxed) {
            IDLE => None,
            v => Some(v),
        }
    }

    /// Stops pinning the last generation this worker touched.
    ///
    /// Call this before a thread goes idle for a long time so that old generations can be freed.
    pub fn quiesce(&self) {
        self.record.watermark.store(IDLE, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn publish(&self, version: u64) {
        self.record.watermark.store(version, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn table(&self) -> usize {
        self.table
    }

    /// Counts an insert and reports whether a periodic status check is due.
    #[inline]
    pub(crate) fn status_due(&self, interval: Option<u64>) -> bool {
        match interval {
            Some(every) => {
                let n = self.inserts.get().wrapping_add(1);
                self.inserts.set(n);
                n % every == 0
            }
            None => false,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.record.watermark.store(IDLE, Ordering::SeqCst);
        self.record.active.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("thread_id", &self.thread_id())
            .field("watermark", &self.watermark())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_over_active_workers() {
        let r = Registry::new();
        assert_eq!(r.min_watermark(7), 7);

        let a = r.register(0, 1);
        let b = r.register(0, 2);
        assert_eq!(r.active(), 2);
        // idle workers don't hold anything back
        assert_eq!(r.min_watermark(7), 7);

        a.publish(3);
        b.publish(5);
        assert_eq!(r.min_watermark(7), 3);
        assert_eq!(a.watermark(), Some(3));

        a.quiesce();
        assert_eq!(r.min_watermark(7), 5);
        drop(b);
        assert_eq!(r.min_watermark(7), 7);
        assert_eq!(r.active(), 1);
    }

    #[test]
    fn records_are_reused() {
        let r = Registry::new();
        let a = r.register(0, 1);
        drop(a);
        let b = r.register(0, 9);
        assert_eq!(b.thread_id(), 9);
        assert_eq!(b.watermark(), None);
        assert_eq!(r.iter().count(), 1);
    }

    #[test]
    fn concurrent_registration() {
        let r = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    let w = r.register(0, i);
                    w.publish(i as u64 + 10);
                    // keep the record active until everyone has registered
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    r.min_watermark(100)
                })
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap() >= 10);
        }
        assert_eq!(r.active(), 0);
    }

    #[test]
    fn status_interval() {
        let r = Registry::new();
        let w = r.register(0, 0);
        assert!(!w.status_due(None));
        assert!(!w.status_due(Some(3)));
        assert!(!w.status_due(Some(3)));
        assert!(w.status_due(Some(3)));
    }
}
