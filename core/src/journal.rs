//! Append-only event journal.
//!
//! The journal is the audit trail of the system: inventory transactions,
//! coupon redemptions, and order status history are all written here once and
//! never edited. Replaying a stream through a reducer's `apply` rebuilds the
//! aggregate, which is what reconciliation relies on.
//!
//! # Dyn Compatibility
//!
//! This trait returns boxed futures instead of using `async fn` so stores can
//! hold an `Arc<dyn Journal<E>>`.

use crate::stream::{StreamId, Version};
use futures::future::BoxFuture;
use thiserror::Error;

/// Errors that can occur during journal operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    /// Optimistic concurrency conflict: the stream moved underneath the writer.
    ///
    /// Stores are single-writer per stream, so this indicates two stores were
    /// created for the same aggregate key.
    #[error("Concurrency conflict on {stream_id}: expected {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream where the conflict occurred.
        stream_id: StreamId,
        /// The version the writer expected.
        expected: Version,
        /// The version actually found.
        actual: Version,
    },

    /// The journal backend could not be reached or is in a failed state.
    #[error("Journal unavailable: {0}")]
    Unavailable(String),
}

/// Append-only storage of events, partitioned into streams.
pub trait Journal<E>: Send + Sync {
    /// Append events to a stream.
    ///
    /// With `expected_version = Some(v)` the append only succeeds if the
    /// stream is currently at `v`. Returns the stream's new version.
    ///
    /// # Errors
    ///
    /// - [`JournalError::ConcurrencyConflict`] when the expected version is stale
    /// - [`JournalError::Unavailable`] when the backend fails
    fn append(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<E>,
    ) -> BoxFuture<'_, Result<Version, JournalError>>;

    /// Load every event of a stream in append order.
    ///
    /// An unknown stream loads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Unavailable`] when the backend fails.
    fn load(&self, stream_id: StreamId) -> BoxFuture<'_, Result<Vec<E>, JournalError>>;
}
