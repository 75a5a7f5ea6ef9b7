//! Error type shared by the collections.
//!
//! Contention is never reported here; lock-free retries stay internal.

use thiserror::Error;

/// Failures surfaced by the collections in this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurError {
    /// Indexer-style lookup of a key that is not present
    #[error("Key not found")]
    KeyNotFound,

    /// A destination buffer cannot hold the collection's current contents
    #[error("Capacity exceeded: need {required} slots, destination has {available}")]
    CapacityExceeded {
        /// Number of slots the copy needs
        required: usize,
        /// Number of slots the destination offers
        available: usize,
    },

    /// A parameter or configuration value is out of range
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument
        message: String,
    },
}

impl ConcurError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(required: usize, available: usize) -> Self {
        Self::CapacityExceeded {
            required,
            available,
        }
    }
}

/// Result type specialized for this crate's errors
pub type Result<T> = std::result::Result<T, ConcurError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ConcurError::KeyNotFound.to_string(), "Key not found");
        assert_eq!(
            ConcurError::capacity_exceeded(4, 2).to_string(),
            "Capacity exceeded: need 4 slots, destination has 2"
        );
        assert_eq!(
            ConcurError::invalid_argument("max_load must be positive").to_string(),
            "Invalid argument: max_load must be positive"
        );
    }
}
