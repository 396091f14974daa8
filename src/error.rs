use std::io;

/// Errors that can be returned by table construction and by operations that allocate.
///
/// Ordinary outcomes such as "key already present" or "key not found" are not errors; they are
/// reported through the `bool`/`Option` return values of the individual operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A new generation of the table could not be allocated.
    #[error("failed to allocate a table generation of {buckets} buckets")]
    Allocation {
        /// The number of buckets that was requested.
        buckets: usize,
    },

    /// The persistent pool has no block large enough for the request.
    #[error("pool exhausted: requested {requested} bytes, {available} bytes left")]
    PoolExhausted {
        /// Size of the failed request, rounded to its size class.
        requested: usize,
        /// Bytes that were still available for bump allocation.
        available: usize,
    },

    /// The pool file could not be created, opened, mapped or flushed.
    #[error("pool I/O failed")]
    Io(#[from] io::Error),

    /// The pool file exists but does not contain a table this crate can open.
    #[error("corrupt pool: {0}")]
    Corrupt(String),

    /// The supplied configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Shorthand for results carrying a [`crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
