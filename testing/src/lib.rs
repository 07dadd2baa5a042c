//! # Fulfillment Testing
//!
//! Testing utilities for the fulfillment services.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A Given-When-Then harness for reducers ([`ReducerTest`])
//!
//! ## Example
//!
//! ```
//! use fulfillment_testing::{test_clock, ManualClock};
//! use fulfillment_core::environment::Clock;
//! use chrono::Duration;
//!
//! let clock = ManualClock::starting_at(test_clock().now());
//! let before = clock.now();
//! clock.advance(Duration::minutes(30));
//! assert_eq!(clock.now() - before, Duration::minutes(30));
//! ```

use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;

/// Reducer test harness
pub mod reducer_test;

pub use reducer_test::ReducerTest;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used for expiry behaviour: cart TTLs, coupon validity windows, and the
    /// age threshold of pending orders during reconciliation.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start the clock at `time`.
        #[must_use]
        pub const fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        #[allow(clippy::unwrap_used)] // A poisoned test clock should fail the test
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{test_clock, FixedClock, ManualClock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let start = test_clock().now();
        let clock = ManualClock::starting_at(start);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
