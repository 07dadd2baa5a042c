//! Single-writer stores.
//!
//! A [`Store`] owns one aggregate's state behind an async mutex. Sending a
//! command runs the reducer, journals the resulting events, and only then
//! applies them, all while the mutex is held. Two commands for the same key can
//! therefore never interleave, and a command that fails to journal leaves the
//! state untouched.
//!
//! The mutex is held only for that short critical section. Callers that need
//! to talk to slow external systems do so between commands, never inside one.

use fulfillment_core::journal::{Journal, JournalError};
use fulfillment_core::reducer::{Events, Reducer};
use fulfillment_core::stream::{StreamId, Version};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

struct Slot<S> {
    state: S,
    version: Version,
}

/// Runtime coordinator for a single aggregate instance.
///
/// # Example
///
/// ```ignore
/// let store = Store::new("inventory", stream_id, InventoryRecord::empty(key), InventoryReducer, env);
/// let events = store.send(InventoryCommand::Reserve { .. }).await?;
/// let reserved = store.state(|record| record.reserved).await;
/// ```
pub struct Store<R: Reducer> {
    kind: &'static str,
    stream_id: StreamId,
    reducer: R,
    environment: R::Environment,
    journal: Option<Arc<dyn Journal<R::Event>>>,
    slot: Mutex<Slot<R::State>>,
}

impl<R: Reducer> Store<R> {
    /// Create a store around an initial state.
    ///
    /// `kind` names the aggregate type in logs and metrics.
    #[must_use]
    pub fn new(
        kind: &'static str,
        stream_id: StreamId,
        initial_state: R::State,
        reducer: R,
        environment: R::Environment,
    ) -> Self {
        Self {
            kind,
            stream_id,
            reducer,
            environment,
            journal: None,
            slot: Mutex::new(Slot {
                state: initial_state,
                version: Version::INITIAL,
            }),
        }
    }

    /// Journal every accepted event to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn Journal<R::Event>>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// The stream this store writes to.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Process a command atomically with respect to every other command on
    /// this store.
    ///
    /// Returns the events that were journaled and applied. An empty batch means
    /// the command was an accepted no-op.
    ///
    /// # Errors
    ///
    /// Returns the reducer's rejection, or a [`JournalError`] converted into the
    /// reducer's error type when the events could not be persisted. In both
    /// cases the state is unchanged.
    pub async fn send(&self, command: R::Command) -> Result<Events<R::Event>, R::Error>
    where
        R::Event: Clone,
        R::Error: From<JournalError>,
    {
        let started = Instant::now();
        let mut slot = self.slot.lock().await;

        let events = match self.reducer.reduce(&slot.state, command, &self.environment) {
            Ok(events) => events,
            Err(error) => {
                metrics::counter!("fulfillment_store_commands_total", "kind" => self.kind, "outcome" => "rejected")
                    .increment(1);
                return Err(error);
            },
        };

        if events.is_empty() {
            metrics::counter!("fulfillment_store_commands_total", "kind" => self.kind, "outcome" => "noop")
                .increment(1);
            return Ok(events);
        }

        slot.version = match &self.journal {
            Some(journal) => {
                journal
                    .append(self.stream_id.clone(), Some(slot.version), events.to_vec())
                    .await?
            },
            None => slot.version.advance(events.len()),
        };

        for event in &events {
            self.reducer.apply(&mut slot.state, event);
        }
        drop(slot);

        metrics::counter!("fulfillment_store_commands_total", "kind" => self.kind, "outcome" => "accepted")
            .increment(1);
        metrics::histogram!("fulfillment_store_command_duration_seconds", "kind" => self.kind)
            .record(started.elapsed().as_secs_f64());

        Ok(events)
    }

    /// Read from the current state.
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&R::State) -> T,
    {
        let slot = self.slot.lock().await;
        f(&slot.state)
    }

    /// Number of events applied so far.
    pub async fn version(&self) -> Version {
        self.slot.lock().await.version
    }

    /// Rebuild state by folding this store's journaled stream onto `initial`.
    ///
    /// Without a journal the initial state is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the stream cannot be loaded.
    pub async fn replay(&self, mut initial: R::State) -> Result<R::State, JournalError> {
        if let Some(journal) = &self.journal {
            for event in journal.load(self.stream_id.clone()).await? {
                self.reducer.apply(&mut initial, &event);
            }
        }
        Ok(initial)
    }

    /// Replay the journaled stream onto `initial` while holding the store's
    /// lock, then hand the live and replayed states to `compare`.
    ///
    /// No command can run in between, so any difference is real drift.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the stream cannot be loaded.
    pub async fn compare_with_replay<F, T>(&self, initial: R::State, compare: F) -> Result<T, JournalError>
    where
        F: FnOnce(&R::State, &R::State) -> T,
    {
        let slot = self.slot.lock().await;
        let mut replayed = initial;
        if let Some(journal) = &self.journal {
            for event in journal.load(self.stream_id.clone()).await? {
                self.reducer.apply(&mut replayed, &event);
            }
        }
        Ok(compare(&slot.state, &replayed))
    }
}

/// A family of stores, one per aggregate key.
///
/// Stores are created on first use and never share a lock with each other.
pub struct KeyedStore<K, R: Reducer> {
    kind: &'static str,
    reducer: R,
    environment: R::Environment,
    journal: Option<Arc<dyn Journal<R::Event>>>,
    stores: RwLock<HashMap<K, Arc<Store<R>>>>,
}

impl<K, R> KeyedStore<K, R>
where
    K: Eq + Hash + Clone + Display,
    R: Reducer + Clone,
    R::Environment: Clone,
{
    /// Create an empty family of stores of the given kind.
    #[must_use]
    pub fn new(kind: &'static str, reducer: R, environment: R::Environment) -> Self {
        Self {
            kind,
            reducer,
            environment,
            journal: None,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Journal every store's events to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn Journal<R::Event>>) -> Self {
        self.journal = Some(journal);
        self
    }

    fn build(&self, key: &K, state: R::State) -> Arc<Store<R>> {
        let store = Store::new(
            self.kind,
            StreamId::for_key(self.kind, key),
            state,
            self.reducer.clone(),
            self.environment.clone(),
        );
        Arc::new(match &self.journal {
            Some(journal) => store.with_journal(Arc::clone(journal)),
            None => store,
        })
    }

    /// The store for `key`, if one exists.
    pub async fn get(&self, key: &K) -> Option<Arc<Store<R>>> {
        self.stores.read().await.get(key).cloned()
    }

    /// The store for `key`, created from `init` if it does not exist yet.
    pub async fn get_or_create<F>(&self, key: &K, init: F) -> Arc<Store<R>>
    where
        F: FnOnce() -> R::State,
    {
        if let Some(store) = self.get(key).await {
            return store;
        }
        let mut stores = self.stores.write().await;
        Arc::clone(
            stores
                .entry(key.clone())
                .or_insert_with(|| self.build(key, init())),
        )
    }

    /// Create a store for a key that must not exist yet.
    ///
    /// Returns `None` when the key is already taken.
    pub async fn create(&self, key: K, state: R::State) -> Option<Arc<Store<R>>> {
        let mut stores = self.stores.write().await;
        if stores.contains_key(&key) {
            return None;
        }
        let store = self.build(&key, state);
        stores.insert(key, Arc::clone(&store));
        Some(store)
    }

    /// Drop the store for `key`.
    pub async fn remove(&self, key: &K) -> Option<Arc<Store<R>>> {
        self.stores.write().await.remove(key)
    }

    /// Snapshot of all keys and their stores.
    pub async fn entries(&self) -> Vec<(K, Arc<Store<R>>)> {
        self.stores
            .read()
            .await
            .iter()
            .map(|(key, store)| (key.clone(), Arc::clone(store)))
            .collect()
    }

    /// Number of live stores.
    pub async fn len(&self) -> usize {
        self.stores.read().await.len()
    }

    /// Whether no store has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.stores.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use fulfillment_core::smallvec;

    #[derive(Clone)]
    struct SlotReducer;

    #[derive(Debug, PartialEq)]
    enum SlotError {
        Full,
        Journal(JournalError),
    }

    impl From<JournalError> for SlotError {
        fn from(error: JournalError) -> Self {
            Self::Journal(error)
        }
    }

    impl Reducer for SlotReducer {
        type State = u32;
        type Command = ();
        type Event = u32;
        type Error = SlotError;
        type Environment = u32;

        fn reduce(&self, taken: &u32, (): (), capacity: &u32) -> Result<Events<u32>, SlotError> {
            if taken >= capacity {
                return Err(SlotError::Full);
            }
            Ok(smallvec![taken + 1])
        }

        fn apply(&self, taken: &mut u32, event: &u32) {
            *taken = *event;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commands_never_exceed_capacity() {
        let store = Arc::new(Store::new("slot", StreamId::new("slot-a"), 0, SlotReducer, 10));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.send(()).await.is_ok() })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 10);
        assert_eq!(store.state(|taken| *taken).await, 10);
        assert_eq!(store.version().await, Version::new(10));
    }

    #[tokio::test]
    async fn rejected_command_is_not_journaled() {
        let journal = Arc::new(InMemoryJournal::new());
        let store = Store::new("slot", StreamId::new("slot-b"), 0, SlotReducer, 1)
            .with_journal(journal.clone());

        store.send(()).await.unwrap();
        assert_eq!(store.send(()).await, Err(SlotError::Full));

        assert_eq!(journal.load(StreamId::new("slot-b")).await.unwrap(), vec![1]);
        assert_eq!(store.replay(0).await.unwrap(), 1);
        assert!(store.compare_with_replay(0, |live, replayed| live == replayed).await.unwrap());
    }

    #[tokio::test]
    async fn keyed_store_creates_each_key_once() {
        let stores = KeyedStore::new("slot", SlotReducer, 3);

        let first = stores.get_or_create(&"a".to_string(), || 0).await;
        first.send(()).await.unwrap();
        let again = stores.get_or_create(&"a".to_string(), || 0).await;

        assert_eq!(again.state(|taken| *taken).await, 1);
        assert!(stores.create("a".to_string(), 0).await.is_none());
        assert!(stores.create("b".to_string(), 0).await.is_some());
        assert_eq!(stores.len().await, 2);
        assert_eq!(again.stream_id().as_str(), "slot-a");
    }
}
