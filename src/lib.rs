//! Cache-line hash tables.
//!
//! Concurrent hash tables from `u64` keys to `u64` values, built from buckets that each fill
//! exactly one 64-byte cache line: three key/value slots plus the bucket's synchronization word.
//! Lookups never lock and usually touch a single cache line.
//!
//! Three variants share the same resize and reclamation machinery:
//!
//!  - [`LockTable`]: writers take a per-bucket spinlock; full buckets grow an overflow chain.
//!  - [`LockFreeTable`]: writers update a per-bucket snapshot word with compare-and-swap; full
//!    buckets grow the whole table.
//!  - [`PersistentTable`]: the lock-based algorithm in a memory-mapped pool file, with explicit
//!    flushes so that the table survives a crash.
//!
//! # Workers
//!
//! Every thread registers once with the table it uses and passes the returned [`Worker`] to each
//! operation. The worker publishes which generation of the table the thread may be looking at,
//! and old generations are only freed once no worker can be using them. A worker that goes idle
//! for a long time should call [`Worker::quiesce`] so that it does not hold on to old memory.
//!
//! ```
//! use clht::LockTable;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let table = Arc::new(LockTable::new(16));
//! let threads: Vec<_> = (0..4u64)
//!     .map(|t| {
//!         let table = Arc::clone(&table);
//!         thread::spawn(move || {
//!             let worker = table.register(t as usize);
//!             for k in 1..=100 {
//!                 table.put(t * 1000 + k, k, &worker);
//!             }
//!         })
//!     })
//!     .collect();
//! for t in threads {
//!     t.join().unwrap();
//! }
//! assert_eq!(table.size(), 400);
//! ```
//!
//! # Resizing
//!
//! Writers that create an overflow bucket count it; once a generation has seen too many, the
//! writer grows the table. A table can also check its fill level every so many operations (see
//! [`Config::status_interval`]), or be resized explicitly. A resize builds a new generation,
//! migrates every bucket into it, and swaps it in; writers that run into a migrated bucket help
//! or wait, and readers keep going.
//!
//! # Keys
//!
//! Key `0` marks empty slots. Looking it up or removing it finds nothing, and storing it panics.
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
mod error;
mod gc;
mod generation;
mod hash;
mod index;
mod lb;
mod lf;
mod lock;
mod pmem;
mod reclaim;
mod resize;

#[cfg(feature = "rayon")]
mod rayon_impls;

/// Keys stored in the tables. `0` is reserved.
pub type Key = u64;

/// Values stored in the tables.
pub type Value = u64;

/// Number of key/value slots in one bucket.
pub const ENTRIES_PER_BUCKET: usize = 3;

/// Size of one bucket, which is also the size of a cache line.
pub(crate) const BUCKET_SIZE: usize = 64;

/// Default hasher for the heap tables.
pub type DefaultHashBuilder = ahash::RandomState;

pub use config::Config;
pub use error::{Error, Result};
pub use gc::Worker;
pub use hash::{jenkins64, Jenkins, JenkinsHasher};
pub use index::Index;
pub use lb::LockTable;
pub use lf::LockFreeTable;
pub use pmem::{
    Clflush, FlushPoint, Msync, NoFlush, PersistentTable, Persister, PoolOptions, Region,
    DEFAULT_POOL_SIZE,
};
pub use resize::ResizeDirection;
