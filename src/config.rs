use crate::error::{Error, Result};

/// Tuning knobs shared by all table variants.
///
/// The defaults reproduce the constants of the lock-based table. Use [`Config::lock_free`] for the
/// defaults of the lock-free table, which halves more conservatively.
///
/// ```
/// let config = clht::Config::default()
///     .grow_above(60)
///     .status_interval(Some(100_000));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Shrink when the table is less than this many percent full.
    pub halve_below: usize,
    /// Grow when the table is more than this many percent full.
    pub grow_above: usize,
    /// Target fill percentage after a grow; decides the grow factor.
    pub occupancy_after_resize: usize,
    /// Grow when any bucket chain is longer than this.
    pub max_chain: usize,
    /// A shrink divides the bucket count by this (a power of two).
    pub halve_ratio: usize,
    /// Tables never have fewer buckets than this (a power of two).
    pub min_buckets: usize,
    /// Overflow buckets allowed per primary bucket before a grow is forced.
    pub expansions_per_bucket: usize,
    /// Run a status check every this many inserts of a single worker. `None` disables it.
    pub status_interval: Option<u64>,
    /// Full-bucket observations after which a lock-free insert forces a grow.
    pub no_empty_slot_tries: usize,
    /// How many threads, besides the resizer, may migrate buckets during a grow.
    pub resize_helpers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            halve_below: 5,
            grow_above: 50,
            occupancy_after_resize: 40,
            max_chain: 24,
            halve_ratio: 8,
            min_buckets: 8,
            expansions_per_bucket: 1,
            status_interval: None,
            no_empty_slot_tries: 16,
            resize_helpers: 1,
        }
    }
}

impl Config {
    /// The defaults used by [`crate::LockFreeTable::new`].
    pub fn lock_free() -> Self {
        Config {
            halve_ratio: 2,
            ..Config::default()
        }
    }

    pub fn halve_below(mut self, percent: usize) -> Self {
        self.halve_below = percent;
        self
    }

    pub fn grow_above(mut self, percent: usize) -> Self {
        self.grow_above = percent;
        self
    }

    pub fn occupancy_after_resize(mut self, percent: usize) -> Self {
        self.occupancy_after_resize = percent;
        self
    }

    pub fn max_chain(mut self, depth: usize) -> Self {
        self.max_chain = depth;
        self
    }

    pub fn halve_ratio(mut self, ratio: usize) -> Self {
        self.halve_ratio = ratio;
        self
    }

    pub fn min_buckets(mut self, buckets: usize) -> Self {
        self.min_buckets = buckets;
        self
    }

    pub fn expansions_per_bucket(mut self, expansions: usize) -> Self {
        self.expansions_per_bucket = expansions;
        self
    }

    pub fn status_interval(mut self, interval: Option<u64>) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn no_empty_slot_tries(mut self, tries: usize) -> Self {
        self.no_empty_slot_tries = tries;
        self
    }

    pub fn resize_helpers(mut self, helpers: usize) -> Self {
        self.resize_helpers = helpers;
        self
    }

    /// Checks that the configuration describes a usable table.
    pub fn validate(&self) -> Result<()> {
        if !self.min_buckets.is_power_of_two() {
            return Err(Error::InvalidConfig("min_buckets must be a power of two"));
        }
        if self.halve_ratio < 2 || !self.halve_ratio.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "halve_ratio must be a power of two of at least 2",
            ));
        }
        if self.grow_above == 0 || self.grow_above > 100 {
            return Err(Error::InvalidConfig("grow_above must be within 1..=100"));
        }
        if self.halve_below >= self.grow_above {
            return Err(Error::InvalidConfig(
                "halve_below must be smaller than grow_above",
            ));
        }
        if self.occupancy_after_resize == 0 {
            return Err(Error::InvalidConfig("occupancy_after_resize must be positive"));
        }
        if self.no_empty_slot_tries == 0 {
            return Err(Error::InvalidConfig("no_empty_slot_tries must be positive"));
        }
        if self.status_interval == Some(0) {
            return Err(Error::InvalidConfig("status_interval must be positive"));
        }
        Ok(())
    }

    /// The number of buckets a new table with the requested size will start out with.
    pub(crate) fn initial_buckets(&self, requested: usize) -> usize {
        requested.max(self.min_buckets).next_power_of_two()
    }

    /// Overflow buckets a generation of `buckets` may create before a grow is forced.
    pub(crate) fn expand_threshold(&self, buckets: usize) -> usize {
        (self.expansions_per_bucket * buckets).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
        Config::lock_free().validate().unwrap();
        assert_eq!(Config::lock_free().halve_ratio, 2);
        assert_eq!(Config::default().status_interval, None);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::default().min_buckets(12).validate().is_err());
        assert!(Config::default().halve_ratio(1).validate().is_err());
        assert!(Config::default().halve_ratio(6).validate().is_err());
        assert!(Config::default().halve_below(60).validate().is_err());
        assert!(Config::default().grow_above(101).validate().is_err());
        assert!(Config::default().status_interval(Some(0)).validate().is_err());
        assert!(Config::default().no_empty_slot_tries(0).validate().is_err());
    }

    #[test]
    fn initial_buckets() {
        let c = Config::default();
        assert_eq!(c.initial_buckets(0), 8);
        assert_eq!(c.initial_buckets(8), 8);
        assert_eq!(c.initial_buckets(9), 16);
        assert_eq!(c.initial_buckets(1000), 1024);
        assert_eq!(c.expand_threshold(64), 64);
        assert_eq!(c.clone().expansions_per_bucket(0).expand_threshold(64), 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde() {
        let c = Config::default().grow_above(70);
        let s = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&s).unwrap();
        assert_eq!(back, c);
        // missing fields fall back to the defaults
        let partial: Config = serde_json::from_str(r#"{"max_chain": 4}"#).unwrap();
        assert_eq!(partial, Config::default().max_chain(4));
    }
}
