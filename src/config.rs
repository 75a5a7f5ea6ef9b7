//! Tuning knobs for the dictionary and the bag.

use crate::error::{ConcurError, Result};
use crate::split_list::MAX_BUCKETS;

/// Sizing of a [`ConcurrentDictionary`](crate::ConcurrentDictionary)'s
/// split-ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryConfig {
    /// Bucket count the list starts with. Must be a power of two.
    pub initial_buckets: usize,
    /// Average entries per bucket tolerated before the bucket count doubles.
    pub max_load: usize,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        Self {
            initial_buckets: 16,
            max_load: 4,
        }
    }
}

impl DictionaryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_buckets(mut self, initial_buckets: usize) -> Self {
        self.initial_buckets = initial_buckets;
        self
    }

    pub fn with_max_load(mut self, max_load: usize) -> Self {
        self.max_load = max_load;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.initial_buckets.is_power_of_two() {
            return Err(ConcurError::invalid_argument(format!(
                "initial_buckets must be a power of two, got {}",
                self.initial_buckets
            )));
        }

        if self.initial_buckets > MAX_BUCKETS {
            return Err(ConcurError::invalid_argument(format!(
                "initial_buckets must not exceed {}, got {}",
                MAX_BUCKETS, self.initial_buckets
            )));
        }

        if self.max_load == 0 {
            return Err(ConcurError::invalid_argument("max_load must be positive"));
        }

        Ok(())
    }
}

/// Sizing of the per-thread deques inside a [`ConcurrentBag`](crate::ConcurrentBag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BagConfig {
    /// Initial slot count of each deque; deques grow by doubling.
    pub deque_capacity: usize,
}

impl Default for BagConfig {
    fn default() -> Self {
        Self { deque_capacity: 32 }
    }
}

impl BagConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deque_capacity(mut self, deque_capacity: usize) -> Self {
        self.deque_capacity = deque_capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.deque_capacity.is_power_of_two() {
            return Err(ConcurError::invalid_argument(format!(
                "deque_capacity must be a power of two, got {}",
                self.deque_capacity
            )));
        }

        Ok(())
    }
}
