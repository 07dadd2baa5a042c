//! In-memory [`Journal`] implementation.
//!
//! Keeps a single global append log, so the order in which events were
//! written across streams is preserved for audit queries.

use fulfillment_core::journal::{Journal, JournalError};
use fulfillment_core::stream::{StreamId, Version};
use futures::future::{self, BoxFuture};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

struct Entries<E> {
    log: Vec<(StreamId, E)>,
    versions: HashMap<StreamId, Version>,
}

/// Journal that keeps every event in process memory.
pub struct InMemoryJournal<E> {
    entries: Mutex<Entries<E>>,
}

impl<E> Default for InMemoryJournal<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                log: Vec::new(),
                versions: HashMap::new(),
            }),
        }
    }
}

impl<E: Clone> InMemoryJournal<E> {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries<E>>, JournalError> {
        self.entries
            .lock()
            .map_err(|_| JournalError::Unavailable("journal lock poisoned".to_string()))
    }

    fn append_now(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<E>,
    ) -> Result<Version, JournalError> {
        let mut entries = self.lock()?;
        let actual = entries.versions.get(&stream_id).copied().unwrap_or_default();
        if let Some(expected) = expected_version.filter(|expected| *expected != actual) {
            return Err(JournalError::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            });
        }

        let next = actual.advance(events.len());
        entries.versions.insert(stream_id.clone(), next);
        entries
            .log
            .extend(events.into_iter().map(|event| (stream_id.clone(), event)));
        Ok(next)
    }

    fn load_now(&self, stream_id: &StreamId) -> Result<Vec<E>, JournalError> {
        Ok(self
            .lock()?
            .log
            .iter()
            .filter(|(id, _)| id == stream_id)
            .map(|(_, event)| event.clone())
            .collect())
    }

    /// Every event in global append order, tagged with its stream.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] if the journal lock was poisoned.
    pub fn all(&self) -> Result<Vec<(StreamId, E)>, JournalError> {
        Ok(self.lock()?.log.clone())
    }

    /// Total number of events across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |entries| entries.log.len())
    }

    /// Whether nothing has been journaled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Journal<E> for InMemoryJournal<E>
where
    E: Clone + Send + Sync,
{
    fn append(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<E>,
    ) -> BoxFuture<'_, Result<Version, JournalError>> {
        Box::pin(future::ready(self.append_now(stream_id, expected_version, events)))
    }

    fn load(&self, stream_id: StreamId) -> BoxFuture<'_, Result<Vec<E>, JournalError>> {
        Box::pin(future::ready(self.load_now(&stream_id)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_are_versioned_per_stream() {
        let journal = InMemoryJournal::new();
        let a = StreamId::new("a");
        let b = StreamId::new("b");

        assert_eq!(journal.append(a.clone(), Some(Version::INITIAL), vec![1, 2]).await, Ok(Version::new(2)));
        assert_eq!(journal.append(b.clone(), None, vec![10]).await, Ok(Version::new(1)));
        assert_eq!(journal.append(a.clone(), Some(Version::new(2)), vec![3]).await, Ok(Version::new(3)));

        assert_eq!(journal.load(a).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(journal.load(b).await.unwrap(), vec![10]);
        assert_eq!(journal.len(), 4);
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new("order-1");
        journal.append(stream.clone(), None, vec!["placed"]).await.unwrap();

        let result = journal.append(stream.clone(), Some(Version::INITIAL), vec!["again"]).await;

        assert_eq!(
            result,
            Err(JournalError::ConcurrencyConflict {
                stream_id: stream,
                expected: Version::INITIAL,
                actual: Version::new(1),
            })
        );
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn global_log_keeps_cross_stream_order() {
        let journal = InMemoryJournal::new();
        journal.append(StreamId::new("x"), None, vec!['a']).await.unwrap();
        journal.append(StreamId::new("y"), None, vec!['b']).await.unwrap();
        journal.append(StreamId::new("x"), None, vec!['c']).await.unwrap();

        let order: Vec<char> = journal.all().unwrap().into_iter().map(|(_, e)| e).collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
    }
}
