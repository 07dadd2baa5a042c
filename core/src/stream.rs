//! Journal stream identification and versioning types.
//!
//! Each aggregate instance (one inventory record, one coupon, one order) writes
//! to its own stream. A stream's [`Version`] is the number of events it holds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single aggregate's event stream.
///
/// Stream ids are built from an aggregate kind prefix and the aggregate key:
///
/// ```
/// use fulfillment_core::stream::StreamId;
///
/// let id = StreamId::for_key("order", "7f0c");
/// assert_eq!(id.as_str(), "order-7f0c");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a `StreamId` from a raw string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a `StreamId` of the form `{prefix}-{key}`.
    #[must_use]
    pub fn for_key(prefix: &str, key: impl fmt::Display) -> Self {
        Self(format!("{prefix}-{key}"))
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of events in a stream.
///
/// A fresh stream is at version 0; appending `n` events moves it to `n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version of an empty stream.
    pub const INITIAL: Self = Self(0);

    /// Create a version from a raw count.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw event count.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Version after appending `count` more events.
    #[must_use]
    pub const fn advance(self, count: usize) -> Self {
        Self(self.0.saturating_add(count as u64))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_advances_by_batch_size() {
        assert_eq!(Version::INITIAL.advance(3), Version::new(3));
        assert_eq!(Version::new(3).advance(0), Version::new(3));
    }

    #[test]
    fn stream_ids_with_same_key_are_equal() {
        assert_eq!(StreamId::for_key("coupon", "SAVE10"), StreamId::new("coupon-SAVE10"));
    }
}
