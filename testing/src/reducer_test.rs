//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use fulfillment_core::reducer::Reducer;

type StateAssertion<S> = Box<dyn FnOnce(&S)>;
type EventAssertion<E> = Box<dyn FnOnce(&[E])>;
type ErrorAssertion<Err> = Box<dyn FnOnce(&Err)>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// Accepted commands have their events applied before the state assertions
/// run, exactly as a store would. Rejected commands leave the given state
/// untouched, and `then_error` assertions receive the rejection.
///
/// # Example
///
/// ```ignore
/// use fulfillment_testing::ReducerTest;
///
/// ReducerTest::new(InventoryReducer)
///     .with_env(test_environment())
///     .given_state(record_with(10, 0))
///     .when_command(InventoryCommand::Reserve { quantity: 4, .. })
///     .then_state(|record| assert_eq!(record.reserved, 4))
///     .then_events(|events| assert_eq!(events.len(), 1))
///     .run();
/// ```
pub struct ReducerTest<R: Reducer> {
    reducer: R,
    environment: Option<R::Environment>,
    initial_state: Option<R::State>,
    command: Option<R::Command>,
    state_assertions: Vec<StateAssertion<R::State>>,
    event_assertions: Vec<EventAssertion<R::Event>>,
    error_assertions: Vec<ErrorAssertion<R::Error>>,
}

impl<R: Reducer> ReducerTest<R>
where
    R::Error: std::fmt::Debug,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            command: None,
            state_assertions: Vec::new(),
            event_assertions: Vec::new(),
            error_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: R::Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: R::State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Set the command to test (When)
    #[must_use]
    pub fn when_command(mut self, command: R::Command) -> Self {
        self.command = Some(command);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&R::State) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the emitted events (Then)
    ///
    /// The command must be accepted.
    #[must_use]
    pub fn then_events<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[R::Event]) + 'static,
    {
        self.event_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the rejection (Then)
    ///
    /// The command must be rejected.
    #[must_use]
    pub fn then_error<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&R::Error) + 'static,
    {
        self.error_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, command, or environment is not set, if the
    /// command's outcome does not match the kind of assertions registered, or
    /// if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let command = self.command.expect("Command must be set with when_command()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        match self.reducer.reduce(&state, command, &env) {
            Ok(events) => {
                assert!(
                    self.error_assertions.is_empty(),
                    "Expected the command to be rejected, but it emitted {} event(s)",
                    events.len()
                );
                for event in &events {
                    self.reducer.apply(&mut state, event);
                }
                for assertion in self.event_assertions {
                    assertion(&events);
                }
            },
            Err(error) => {
                assert!(
                    self.event_assertions.is_empty(),
                    "Expected the command to be accepted, but it was rejected: {error:?}"
                );
                for assertion in self.error_assertions {
                    assertion(&error);
                }
            },
        }

        for assertion in self.state_assertions {
            assertion(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulfillment_core::reducer::Events;
    use fulfillment_core::smallvec;

    #[derive(Clone, Debug)]
    struct Stock {
        on_hand: u32,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum StockEvent {
        Taken(u32),
    }

    struct StockReducer;

    impl Reducer for StockReducer {
        type State = Stock;
        type Command = u32;
        type Event = StockEvent;
        type Error = String;
        type Environment = ();

        fn reduce(&self, state: &Stock, quantity: u32, _env: &()) -> Result<Events<StockEvent>, String> {
            if quantity > state.on_hand {
                return Err(format!("only {} on hand", state.on_hand));
            }
            Ok(smallvec![StockEvent::Taken(quantity)])
        }

        fn apply(&self, state: &mut Stock, event: &StockEvent) {
            match event {
                StockEvent::Taken(quantity) => state.on_hand -= quantity,
            }
        }
    }

    #[test]
    fn accepted_command_applies_events() {
        ReducerTest::new(StockReducer)
            .with_env(())
            .given_state(Stock { on_hand: 5 })
            .when_command(3)
            .then_events(|events| assert_eq!(events, [StockEvent::Taken(3)]))
            .then_state(|state| assert_eq!(state.on_hand, 2))
            .run();
    }

    #[test]
    fn rejected_command_keeps_state() {
        ReducerTest::new(StockReducer)
            .with_env(())
            .given_state(Stock { on_hand: 1 })
            .when_command(3)
            .then_error(|error| assert_eq!(error, "only 1 on hand"))
            .then_state(|state| assert_eq!(state.on_hand, 1))
            .run();
    }
}
