use clht::{Index, LockFreeTable, LockTable, NoFlush, PersistentTable, PoolOptions};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;
use std::ops::Deref;
use tempfile::TempDir;

const ITER: u64 = 32 * 1024;
const BUCKETS: usize = ITER as usize / clht::ENTRIES_PER_BUCKET;

/// A persistent table in a fresh pool file. The directory goes away with it.
struct Persistent {
    table: PersistentTable,
    _dir: TempDir,
}

fn persistent(buckets: usize) -> Persistent {
    let dir = tempfile::tempdir().unwrap();
    let table = PoolOptions::new(dir.path().join("bench.pool"))
        .size(256 << 20)
        .buckets(buckets)
        .persister(NoFlush)
        .open()
        .unwrap();
    Persistent { table, _dir: dir }
}

fn task_insert<I: Index>(table: &I) {
    (1..=ITER).into_par_iter().for_each_init(
        || table.register(rayon::current_thread_index().unwrap_or(0)),
        |worker, i| {
            assert!(table.put(i, i + 7, worker).unwrap());
        },
    );
}

fn task_get<I: Index>(table: &I) {
    (1..=ITER).into_par_iter().for_each_init(
        || table.register(rayon::current_thread_index().unwrap_or(0)),
        |worker, i| {
            assert_eq!(table.get(i, worker), Some(i + 7));
        },
    );
}

fn task_mixed<I: Index>(table: &I) {
    (1..=ITER).into_par_iter().for_each_init(
        || table.register(rayon::current_thread_index().unwrap_or(0)),
        |worker, i| {
            let key = i + ITER;
            if i % 10 == 0 {
                table.put(key, i, worker).unwrap();
            } else if i % 10 == 1 {
                table.remove(key - 1, worker).unwrap();
            } else {
                black_box(table.get(i, worker));
            }
        },
    );
}

fn bench_tables<T>(
    c: &mut Criterion,
    name: &str,
    buckets: usize,
    new: impl Fn(usize) -> T + Sync,
) where
    T: Deref + Send + Sync,
    T::Target: Index + Sized,
{
    let max = num_cpus::get();

    let mut group = c.benchmark_group(format!("insert_{}", name));
    group.throughput(Throughput::Elements(ITER));
    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| {
                    b.iter_with_large_drop(|| {
                        let table = new(buckets);
                        task_insert(&*table);
                        table
                    })
                });
            },
        );
    }
    group.finish();

    let mut group = c.benchmark_group(format!("get_{}", name));
    group.throughput(Throughput::Elements(ITER));
    let table = new(buckets);
    task_insert(&*table);
    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| b.iter(|| task_get(&*table)));
            },
        );
    }
    group.finish();

    let mut group = c.benchmark_group(format!("mixed_{}", name));
    group.throughput(Throughput::Elements(ITER));
    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| b.iter(|| task_mixed(&*table)));
            },
        );
    }
    group.finish();
}

impl Deref for Persistent {
    type Target = PersistentTable;

    fn deref(&self) -> &PersistentTable {
        &self.table
    }
}

fn lock_based(c: &mut Criterion) {
    bench_tables(c, "lock_based", BUCKETS, |n| Box::new(LockTable::new(n)));
}

fn lock_free(c: &mut Criterion) {
    bench_tables(c, "lock_free", BUCKETS, |n| Box::new(LockFreeTable::new(n)));
}

fn persistent_no_flush(c: &mut Criterion) {
    bench_tables(c, "persistent", BUCKETS, persistent);
}

/// Starting from 8 buckets, so that inserts pay for resizes.
fn growing(c: &mut Criterion) {
    bench_tables(c, "lock_based_growing", 8, |n| Box::new(LockTable::new(n)));
    bench_tables(c, "lock_free_growing", 8, |n| Box::new(LockFreeTable::new(n)));
}

criterion_group!(
    benches,
    lock_based,
    lock_free,
    persistent_no_flush,
    growing
);
criterion_main!(benches);
