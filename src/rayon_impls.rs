use crate::{DefaultHashBuilder, Key, LockFreeTable, LockTable, Value};
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};
use std::hash::BuildHasher;

fn thread_id() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

impl<S> ParallelExtend<(Key, Value)> for LockTable<S>
where
    S: BuildHasher + Sync,
{
    // Of limited use due to the `&mut self` parameter. See `par_put`.
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        self.par_put(par_iter);
    }
}

impl<S> LockTable<S>
where
    S: BuildHasher + Sync,
{
    /// Inserts every pair of a parallel iterator, registering one worker per rayon thread.
    /// Keys that are already present keep their value.
    pub fn par_put<I>(&self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        par_iter.into_par_iter().for_each_init(
            || self.register(thread_id()),
            |worker, (k, v)| {
                self.put(k, v, worker);
            },
        );
    }
}

impl FromParallelIterator<(Key, Value)> for LockTable<DefaultHashBuilder> {
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        let mut created = LockTable::new(8);
        created.par_extend(par_iter);
        created
    }
}

impl<S> ParallelExtend<(Key, Value)> for LockFreeTable<S>
where
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        self.par_put(par_iter);
    }
}

impl<S> LockFreeTable<S>
where
    S: BuildHasher + Sync,
{
    /// Inserts every pair of a parallel iterator, registering one worker per rayon thread.
    pub fn par_put<I>(&self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        par_iter.into_par_iter().for_each_init(
            || self.register(thread_id()),
            |worker, (k, v)| {
                self.put(k, v, worker);
            },
        );
    }
}

impl FromParallelIterator<(Key, Value)> for LockFreeTable<DefaultHashBuilder> {
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (Key, Value)>,
    {
        let mut created = LockFreeTable::new(8);
        created.par_extend(par_iter);
        created
    }
}

#[cfg(test)]
mod test {
    use crate::{LockFreeTable, LockTable};
    use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend};

    #[test]
    fn parallel_extend_by_nothing() {
        let to_extend_with: Vec<(u64, u64)> = Vec::new();

        let mut table = LockTable::new(8);
        let worker = table.register(0);
        table.put(1, 2, &worker);
        table.put(3, 4, &worker);

        table.par_extend(to_extend_with.into_par_iter());

        assert_eq!(table.size(), 2);
        assert_eq!(table.get(1, &worker), Some(2));
        assert_eq!(table.get(3, &worker), Some(4));
    }

    #[test]
    fn parallel_extend_by_a_bunch() {
        let to_extend_with: Vec<_> = (0..1000).map(|i| (i + 100, i * 10)).collect();

        let mut table = LockTable::new(8);
        let worker = table.register(0);
        table.put(1, 2, &worker);
        table.put(3, 4, &worker);

        table.par_extend(to_extend_with.into_par_iter());
        assert_eq!(table.size(), 1002);

        assert_eq!(table.get(1, &worker), Some(2));
        assert_eq!(table.get(100, &worker), Some(0));
        assert_eq!(table.get(1099, &worker), Some(9990));
    }

    #[test]
    fn from_empty_parallel_iter() {
        let to_create_from: Vec<(u64, u64)> = Vec::new();
        let created: LockFreeTable = LockFreeTable::from_par_iter(to_create_from.into_par_iter());
        assert_eq!(created.size(), 0);
    }

    #[test]
    fn from_large_parallel_iter() {
        let to_create_from: Vec<_> = (1..=2000u64).map(|i| (i, i * 3)).collect();
        let created: LockFreeTable = LockFreeTable::from_par_iter(to_create_from.into_par_iter());
        assert_eq!(created.size(), 2000);

        let worker = created.register(0);
        assert_eq!(created.get(1, &worker), Some(3));
        assert_eq!(created.get(2000, &worker), Some(6000));
    }
}
