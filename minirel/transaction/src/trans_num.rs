//! Transaction numbering.
//!
//! Transaction numbers are handed out by a [`TransNumGenerator`] owned by the database
//! instance. Recovery pushes the counter forward when it finds a larger number recorded
//! in a checkpoint, so numbers are never reused across restarts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TransNumError;

/// Identifier of a transaction. Numbers start from 1; 0 is never assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TransNum(u64);

impl TransNum {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the transaction number.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TransNum {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Monotonic transaction number generator.
///
/// `current` is the next number that will be handed out; it is the value recorded by
/// begin-checkpoint records.
pub struct TransNumGenerator {
    counter: AtomicU64,
}

impl TransNumGenerator {
    /// Create a new generator starting at 1
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Create a new generator with a starting value
    pub fn with_start(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Generate the next transaction number
    pub fn next(&self) -> Result<TransNum, TransNumError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TransNumError::Overflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(TransNum(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Get the counter value without incrementing
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Raise the counter to `value` if it is currently lower.
    pub fn update_if_greater(&self, value: u64) {
        self.counter.fetch_max(value, Ordering::SeqCst);
    }
}

impl Default for TransNumGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trans_num_generator() {
        let generator = TransNumGenerator::new();
        assert_eq!(generator.current(), 1);

        let t1 = generator.next().unwrap();
        assert_eq!(t1.raw(), 1);
        let t2 = generator.next().unwrap();
        assert_eq!(t2.raw(), 2);
        assert_eq!(generator.current(), 3);
    }

    #[test]
    fn test_update_if_greater() {
        let generator = TransNumGenerator::new();
        generator.update_if_greater(100);
        assert_eq!(generator.current(), 100);

        generator.update_if_greater(50);
        assert_eq!(generator.current(), 100); // Should not decrease

        assert_eq!(generator.next().unwrap(), TransNum::new(100));
    }

    #[test]
    fn test_overflow() {
        let generator = TransNumGenerator::with_start(u64::MAX);
        assert_eq!(generator.next(), Err(TransNumError::Overflow(u64::MAX)));
    }

    #[test]
    fn test_display() {
        assert_eq!(TransNum::new(7).to_string(), "T7");
    }
}
