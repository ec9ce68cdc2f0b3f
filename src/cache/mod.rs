//! Cache tier boundary.
//!
//! Everything the pipeline needs from the fast tier is expressed through
//! [`CacheStore`]: string keys with expiry, list push/pop from both ends
//! (the write queue and per-room history), an unordered set (the dirty-room
//! working set), and two atomic document updates for room metadata. The
//! handle is injected at construction so tests can swap in deterministic or
//! failure-injecting implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

pub mod memory;
pub mod redis;

#[derive(Debug, Snafu)]
pub enum CacheError {
    /// The tier is unreachable. Definitive: trips a circuit breaker on the
    /// first occurrence.
    #[snafu(display("cache tier unreachable: {message}"))]
    Unavailable { message: String },

    /// An operation exceeded its bounded wait. Counts toward the breaker's
    /// failure threshold.
    #[snafu(display("cache operation timed out after {waited:?}"))]
    Timeout { waited: Duration },

    /// The stored payload is malformed. A property of the data, not of the
    /// backend; never feeds a breaker.
    #[snafu(display("malformed cache payload: {message}"))]
    Corrupt { message: String },
}

impl CacheError {
    pub fn unavailable(e: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: e.to_string(),
        }
    }

    pub fn corrupt(e: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            message: e.to_string(),
        }
    }

    /// Failures that say something about the backend's health.
    pub fn is_connectivity(&self) -> bool {
        !matches!(self, Self::Corrupt { .. })
    }

    /// Failures so strongly correlated with further failures that the
    /// breaker should open without accumulating a threshold.
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Key/value store with list, set and expiry semantics.
///
/// List orientation: `push_front` is the producer end; `pop_back` is the
/// consumption end. `push_back` re-inserts at the consumption end, which is
/// what lets a failed batch be retried ahead of newer entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn push_front(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn push_back(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn pop_back(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Up to `count` elements starting at `start`, counted from the front.
    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, CacheError>;

    /// Keeps the `max_len` elements closest to the front.
    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), CacheError>;

    async fn list_len(&self, key: &str) -> Result<usize, CacheError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), CacheError>;

    async fn set_pop(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Atomically stamps `user_id`'s last-read time on the room-metadata
    /// document at `key`. Returns `false` when the document is absent or
    /// the user is not a member; the caller then falls back to the durable
    /// store. Must not clobber concurrent preview/time updates.
    async fn apply_read_status(
        &self,
        key: &str,
        user_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Atomically folds a new message into the room-metadata document at
    /// `key`: preview, monotonically advancing last-message time, and the
    /// sender's own read time. Returns `false` when the document is absent.
    async fn apply_message_meta(
        &self,
        key: &str,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError>;
}
