use std::hash::{BuildHasher, Hasher};

/// Jenkins' 64-bit integer mix.
///
/// Used by the pool-resident table, where bucket placement must be identical across process
/// restarts and therefore cannot depend on a randomly seeded hasher.
#[inline]
pub const fn jenkins64(mut key: u64) -> u64 {
    key = key.wrapping_add(!(key << 32));
    key ^= key >> 22;
    key = key.wrapping_add(!(key << 13));
    key ^= key >> 8;
    key = key.wrapping_add(key << 3);
    key ^= key >> 15;
    key = key.wrapping_add(!(key << 27));
    key ^= key >> 31;
    key
}

/// A [`BuildHasher`] that feeds `u64` keys through [`jenkins64`].
///
/// Deterministic, so it is also handy in tests that want predictable bucket placement.
#[derive(Clone, Copy, Debug, Default)]
pub struct Jenkins;

impl BuildHasher for Jenkins {
    type Hasher = JenkinsHasher;

    fn build_hasher(&self) -> Self::Hasher {
        JenkinsHasher(0)
    }
}

/// The [`Hasher`] produced by [`Jenkins`].
#[derive(Clone, Copy, Debug, Default)]
pub struct JenkinsHasher(u64);

impl Hasher for JenkinsHasher {
    fn finish(&self) -> u64 {
        jenkins64(self.0)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(b);
        }
    }

    fn write_u64(&mut self, i: u64) {
        self.0 ^= i;
    }
}

/// Hashes a key with the given builder.
#[inline]
pub(crate) fn hash_key<S: BuildHasher>(build_hasher: &S, key: u64) -> u64 {
    let mut h = build_hasher.build_hasher();
    h.write_u64(key);
    h.finish()
}
