//! # Fulfillment Runtime
//!
//! Runtime implementation for the fulfillment services.
//!
//! This crate provides:
//! - [`Store`]: single-writer runtime for one aggregate instance
//! - [`KeyedStore`]: one lazily created [`Store`] per aggregate key
//! - [`journal::InMemoryJournal`]: append-only journal kept in memory
//! - Retry with exponential backoff for idempotent external queries
//! - Prometheus metrics recorder installation
//!
//! ## Concurrency model
//!
//! Each store serialises the commands sent to it, so operations on one key are
//! linearizable. Different keys never share a lock, so unrelated orders and
//! inventory records proceed in parallel.

/// In-memory journal implementation
pub mod journal;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-key stores
pub mod store;

pub use journal::InMemoryJournal;
pub use store::{KeyedStore, Store};
