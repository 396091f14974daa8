use crate::error::Result;
use crate::gc::Worker;
use crate::{Key, LockFreeTable, LockTable, PersistentTable, Value};
use std::hash::BuildHasher;

/// The operations every table variant supports, for code that wants to be generic over them.
///
/// The heap tables never fail, so their `put` and `remove` always return `Ok`.
///
/// ```
/// use clht::{Index, LockFreeTable, LockTable};
///
/// fn fill<I: Index>(index: &I) -> clht::Result<()> {
///     let worker = index.register(0);
///     for k in 1..=100 {
///         index.put(k, k * k, &worker)?;
///     }
///     Ok(())
/// }
///
/// let lb = LockTable::new(16);
/// fill(&lb)?;
/// let lf = LockFreeTable::new(16);
/// fill(&lf)?;
/// assert_eq!(lb.size(), lf.size());
/// # Ok::<(), clht::Error>(())
/// ```
pub trait Index: Send + Sync {
    fn register(&self, thread_id: usize) -> Worker;

    fn get(&self, key: Key, worker: &Worker) -> Option<Value>;

    fn put(&self, key: Key, val: Value, worker: &Worker) -> Result<bool>;

    fn remove(&self, key: Key, worker: &Worker) -> Result<Option<Value>>;

    fn size(&self) -> usize;
}

impl<S> Index for LockTable<S>
where
    S: BuildHasher + Send + Sync,
{
    fn register(&self, thread_id: usize) -> Worker {
        LockTable::register(self, thread_id)
    }

    fn get(&self, key: Key, worker: &Worker) -> Option<Value> {
        LockTable::get(self, key, worker)
    }

    fn put(&self, key: Key, val: Value, worker: &Worker) -> Result<bool> {
        Ok(LockTable::put(self, key, val, worker))
    }

    fn remove(&self, key: Key, worker: &Worker) -> Result<Option<Value>> {
        Ok(LockTable::remove(self, key, worker))
    }

    fn size(&self) -> usize {
        LockTable::size(self)
    }
}

impl<S> Index for LockFreeTable<S>
where
    S: BuildHasher + Send + Sync,
{
    fn register(&self, thread_id: usize) -> Worker {
        LockFreeTable::register(self, thread_id)
    }

    fn get(&self, key: Key, worker: &Worker) -> Option<Value> {
        LockFreeTable::get(self, key, worker)
    }

    fn put(&self, key: Key, val: Value, worker: &Worker) -> Result<bool> {
        Ok(LockFreeTable::put(self, key, val, worker))
    }

    fn remove(&self, key: Key, worker: &Worker) -> Result<Option<Value>> {
        Ok(LockFreeTable::remove(self, key, worker))
    }

    fn size(&self) -> usize {
        LockFreeTable::size(self)
    }
}

impl Index for PersistentTable {
    fn register(&self, thread_id: usize) -> Worker {
        PersistentTable::register(self, thread_id)
    }

    fn get(&self, key: Key, worker: &Worker) -> Option<Value> {
        PersistentTable::get(self, key, worker)
    }

    fn put(&self, key: Key, val: Value, worker: &Worker) -> Result<bool> {
        PersistentTable::put(self, key, val, worker)
    }

    fn remove(&self, key: Key, worker: &Worker) -> Result<Option<Value>> {
        PersistentTable::remove(self, key, worker)
    }

    fn size(&self) -> usize {
        PersistentTable::size(self)
    }
}
