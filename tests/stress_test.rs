use clht::*;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Number of keys and values to work with.
const NUM_KEYS: usize = 1 << 10;
/// Operations per worker thread.
const OPS: usize = 20_000;
const THREADS: usize = 4;

/// Shared state of a stress run.
///
/// A thread may only operate on a key while it holds the key's `in_use` flag, so the expected
/// content of the table is always known for the keys it touches.
struct Environment<T> {
    table: T,
    keys: Vec<Key>,
    vals: Vec<AtomicU64>,
    ind_dist: Uniform<usize>,
    in_table: Vec<AtomicBool>,
    in_use: Vec<AtomicBool>,
    finished: AtomicBool,
}

impl<T: Index> Environment<T> {
    fn new(table: T) -> Self {
        let mut keys = Vec::with_capacity(NUM_KEYS);
        let mut in_use = Vec::with_capacity(NUM_KEYS);
        let mut in_table = Vec::with_capacity(NUM_KEYS);
        let mut vals = Vec::with_capacity(NUM_KEYS);

        for i in 0..NUM_KEYS {
            // spread the keys out, and keep clear of 0
            keys.push((i as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
            in_use.push(AtomicBool::new(false));
            in_table.push(AtomicBool::new(false));
            vals.push(AtomicU64::new(0));
        }

        Self {
            table,
            keys,
            vals,
            ind_dist: Uniform::from(0..NUM_KEYS),
            in_table,
            in_use,
            finished: AtomicBool::new(false),
        }
    }

    fn claim(&self, i: usize) -> bool {
        self.in_use[i]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self, i: usize) {
        self.in_use[i].store(false, Ordering::Release);
    }
}

fn stress_thread<T: Index + 'static>(env: Arc<Environment<T>>, id: usize) -> JoinHandle<()> {
    thread::spawn(move || {
        let worker = env.table.register(id);
        let mut rng = rand::thread_rng();
        let mut done = 0;
        while done < OPS {
            let i = env.ind_dist.sample(&mut rng);
            if !env.claim(i) {
                continue;
            }
            let key = env.keys[i];
            let present = env.in_table[i].load(Ordering::Relaxed);
            let expected = present.then(|| env.vals[i].load(Ordering::Relaxed));
            assert_eq!(env.table.get(key, &worker), expected, "key {:#x}", key);

            match rng.gen_range(0..3) {
                0 | 1 => {
                    let val: Value = rng.gen();
                    let inserted = env.table.put(key, val, &worker).unwrap();
                    assert_eq!(inserted, !present, "key {:#x}", key);
                    if inserted {
                        env.vals[i].store(val, Ordering::Relaxed);
                        env.in_table[i].store(true, Ordering::Relaxed);
                    }
                }
                _ => {
                    let removed = env.table.remove(key, &worker).unwrap();
                    assert_eq!(removed, expected, "key {:#x}", key);
                    env.in_table[i].store(false, Ordering::Relaxed);
                }
            }
            env.release(i);
            done += 1;
        }
    })
}

fn check<T: Index>(env: &Environment<T>) {
    let worker = env.table.register(usize::MAX);
    let mut live = 0;
    for i in 0..NUM_KEYS {
        let expected = if env.in_table[i].load(Ordering::Relaxed) {
            live += 1;
            Some(env.vals[i].load(Ordering::Relaxed))
        } else {
            None
        };
        assert_eq!(env.table.get(env.keys[i], &worker), expected);
    }
    assert_eq!(env.table.size(), live);
}

fn run<T: Index + 'static>(table: T, resizer: impl Fn(&T) + Send + 'static) {
    let env = Arc::new(Environment::new(table));
    let threads: Vec<_> = (0..THREADS)
        .map(|id| stress_thread(Arc::clone(&env), id))
        .collect();

    let resize = {
        let env = Arc::clone(&env);
        thread::spawn(move || {
            while !env.finished.load(Ordering::Relaxed) {
                resizer(&env.table);
                thread::yield_now();
            }
        })
    };

    for t in threads {
        t.join().unwrap();
    }
    env.finished.store(true, Ordering::Relaxed);
    resize.join().unwrap();
    check(&env);
}

#[test]
fn stress_lock_based() {
    run(LockTable::new(8), |_| {});
}

#[test]
fn stress_lock_free() {
    run(LockFreeTable::new(8), |_| {});
}

#[test]
fn stress_lock_based_with_resizes() {
    run(LockTable::with_hasher(8, Jenkins), |t| {
        let direction = if rand::thread_rng().gen_bool(0.5) {
            ResizeDirection::Grow { factor: 2 }
        } else {
            ResizeDirection::Shrink
        };
        t.resize(direction).unwrap();
        t.gc_collect();
    });
}

#[test]
fn stress_lock_free_with_resizes() {
    run(LockFreeTable::new(8), |t| {
        let direction = if rand::thread_rng().gen_bool(0.5) {
            ResizeDirection::Grow { factor: 2 }
        } else {
            ResizeDirection::Shrink
        };
        t.resize(direction).unwrap();
        t.gc_collect();
    });
}

#[test]
fn stress_with_status_checks() {
    let config = Config::default().status_interval(Some(64)).resize_helpers(2);
    run(LockTable::with_config(8, config).unwrap(), |t| {
        t.status(false);
    });
}
