//! # Fulfillment Core
//!
//! Core traits and types shared by the fulfillment services.
//!
//! Every piece of shared mutable state in the system (an inventory record, a
//! coupon's usage counters, an order) is modelled as an aggregate driven by a
//! [`reducer::Reducer`]:
//!
//! - **State**: the aggregate's current value
//! - **Command**: a request to change it
//! - **Event**: a fact recorded once a command has been accepted
//! - **Reducer**: validates a command against state and emits events, and
//!   applies events back onto state
//! - **Environment**: injected dependencies (clock, configuration)
//!
//! Events are written to an append-only [`journal::Journal`] before they are
//! applied, so any aggregate can be rebuilt by replaying its stream.
//!
//! ## Example
//!
//! ```
//! use fulfillment_core::reducer::{Events, Reducer};
//! use fulfillment_core::smallvec;
//!
//! #[derive(Default)]
//! struct Counter { value: u32 }
//!
//! enum CounterCommand { Add(u32) }
//!
//! #[derive(Clone)]
//! enum CounterEvent { Added(u32) }
//!
//! struct CounterReducer;
//!
//! impl Reducer for CounterReducer {
//!     type State = Counter;
//!     type Command = CounterCommand;
//!     type Event = CounterEvent;
//!     type Error = String;
//!     type Environment = ();
//!
//!     fn reduce(
//!         &self,
//!         state: &Counter,
//!         command: CounterCommand,
//!         _env: &(),
//!     ) -> Result<Events<CounterEvent>, String> {
//!         match command {
//!             CounterCommand::Add(n) if state.value.checked_add(n).is_some() => {
//!                 Ok(smallvec![CounterEvent::Added(n)])
//!             },
//!             CounterCommand::Add(_) => Err("overflow".to_string()),
//!         }
//!     }
//!
//!     fn apply(&self, state: &mut Counter, event: &CounterEvent) {
//!         match event {
//!             CounterEvent::Added(n) => state.value += n,
//!         }
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Append-only event journal
pub mod journal;

/// Stream identity and versioning
pub mod stream;

/// Reducer module - the core trait for business logic
///
/// Reducers split a state change in two:
///
/// 1. `reduce` validates a command against the current state and returns the
///    events describing the change, or an error. It never mutates state.
/// 2. `apply` folds one accepted event into state. It must be deterministic so
///    that replaying a journal reproduces the live state exactly.
///
/// A rejected command therefore leaves no trace: nothing is journaled and
/// nothing is applied.
pub mod reducer {
    use smallvec::SmallVec;

    /// Batch of events emitted by a single command.
    ///
    /// Most commands emit one or two events, so the batch lives inline.
    pub type Events<E> = SmallVec<[E; 4]>;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The aggregate state this reducer operates on
    /// - `Command`: Requests to change the aggregate
    /// - `Event`: Facts recorded once a command is accepted
    /// - `Error`: Why a command was rejected
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The command type this reducer accepts
        type Command;

        /// The event type this reducer emits
        type Event;

        /// The rejection type
        type Error;

        /// The environment type with injected dependencies
        type Environment;

        /// Validate a command and describe the resulting change as events.
        ///
        /// Returning an empty batch means the command was accepted but changes
        /// nothing (idempotent replays of an already-applied command).
        ///
        /// # Errors
        ///
        /// Returns the reducer's error type when the command violates an
        /// invariant of the current state.
        fn reduce(
            &self,
            state: &Self::State,
            command: Self::Command,
            env: &Self::Environment,
        ) -> Result<Events<Self::Event>, Self::Error>;

        /// Fold an accepted event into state.
        fn apply(&self, state: &mut Self::State, event: &Self::Event);
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the reducer's Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use fulfillment_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reducer::{Events, Reducer};
    use super::smallvec;

    #[derive(Default, Debug, PartialEq)]
    struct Tally {
        total: u64,
    }

    #[derive(Clone, Debug)]
    enum TallyEvent {
        Added(u64),
    }

    struct TallyReducer;

    impl Reducer for TallyReducer {
        type State = Tally;
        type Command = u64;
        type Event = TallyEvent;
        type Error = &'static str;
        type Environment = ();

        fn reduce(&self, _state: &Tally, amount: u64, _env: &()) -> Result<Events<TallyEvent>, &'static str> {
            if amount == 0 {
                return Ok(Events::new());
            }
            Ok(smallvec![TallyEvent::Added(amount)])
        }

        fn apply(&self, state: &mut Tally, event: &TallyEvent) {
            match event {
                TallyEvent::Added(n) => state.total += n,
            }
        }
    }

    #[test]
    fn reduce_does_not_mutate_and_apply_folds() {
        let reducer = TallyReducer;
        let mut state = Tally::default();

        let events = reducer.reduce(&state, 5, &()).unwrap_or_default();
        assert_eq!(state.total, 0);

        for event in &events {
            reducer.apply(&mut state, event);
        }
        assert_eq!(state, Tally { total: 5 });
    }

    #[test]
    fn zero_amount_is_a_no_op() {
        let events = TallyReducer.reduce(&Tally::default(), 0, &()).unwrap_or_default();
        assert!(events.is_empty());
    }
}
