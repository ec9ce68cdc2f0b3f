//! Room-metadata cache with the dirty-room working set.
//!
//! Every cache-only metadata mutation marks its room dirty; the flush loop
//! later reconciles dirty rooms into the durable store. Rooms written
//! through the durable fallback while the cache tier is down are queued in
//! an in-process recovery set so their stale cache keys can be invalidated
//! once the tier heals.
//!
//! All operations here are guarded by the metadata circuit breaker and are
//! best-effort: a cache miss or failure degrades, it never fails the
//! calling write.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheError, CacheStore};
use crate::chatroom::ChatRoomMetadata;

const DIRTY_ROOMS_KEY: &str = "chat:dirty_rooms";

fn room_key(chatroom_id: i64) -> String {
    format!("chat:room_meta:{chatroom_id}")
}

pub struct MetadataCache {
    store: Arc<dyn CacheStore>,
    breaker: CircuitBreaker,
    ttl: Duration,
    io_timeout: Duration,
    pending_recovery: Mutex<HashSet<i64>>,
}

impl MetadataCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        breaker: CircuitBreaker,
        ttl: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            ttl,
            io_timeout,
            pending_recovery: Mutex::new(HashSet::new()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn get(&self, chatroom_id: i64) -> Option<ChatRoomMetadata> {
        if self.breaker.is_open() {
            tracing::debug!(chatroom_id, "metadata circuit open, skipping cache read");
            return None;
        }
        let raw = match self.run(self.store.get(&room_key(chatroom_id))).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::debug!(chatroom_id, error = %e, "metadata cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(chatroom_id, error = %e, "discarding malformed metadata document");
                None
            }
        }
    }

    pub async fn put(&self, meta: &ChatRoomMetadata) {
        if self.breaker.is_open() {
            tracing::debug!(
                chatroom_id = meta.chatroom_id,
                "metadata circuit open, skipping cache write"
            );
            return;
        }
        let json = match serde_json::to_string(meta) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode metadata document");
                return;
            }
        };
        if let Err(e) = self
            .run(self.store.set(&room_key(meta.chatroom_id), &json, Some(self.ttl)))
            .await
        {
            tracing::warn!(chatroom_id = meta.chatroom_id, error = %e, "metadata cache write failed");
        }
    }

    /// Adds the room to the dirty working set. Deduplicating and unordered:
    /// only convergence matters, not reconciliation order.
    pub async fn mark_dirty(&self, chatroom_id: i64) -> Result<(), CacheError> {
        self.run(self.store.set_add(DIRTY_ROOMS_KEY, &chatroom_id.to_string()))
            .await
    }

    pub async fn pop_dirty(&self) -> Option<i64> {
        if self.breaker.is_open() {
            return None;
        }
        match self.run(self.store.set_pop(DIRTY_ROOMS_KEY)).await {
            Ok(member) => member?.parse().ok(),
            Err(e) => {
                tracing::debug!(error = %e, "failed to pop dirty room");
                None
            }
        }
    }

    /// Atomic read-status stamp. Returns `false` when the cache could not
    /// take the update (circuit open, document absent, not a member); the
    /// caller then writes through to the durable store instead.
    pub async fn apply_read_status(&self, chatroom_id: i64, user_id: i64, at: DateTime<Utc>) -> bool {
        if self.breaker.is_open() {
            tracing::debug!(chatroom_id, "metadata circuit open, skipping read-status update");
            return false;
        }
        let applied = self
            .run(
                self.store
                    .apply_read_status(&room_key(chatroom_id), user_id, at, self.ttl),
            )
            .await;
        match applied {
            Ok(true) => {
                if let Err(e) = self.mark_dirty(chatroom_id).await {
                    tracing::debug!(chatroom_id, error = %e, "failed to mark room dirty");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(chatroom_id, error = %e, "read-status cache update failed");
                false
            }
        }
    }

    /// Atomically folds an accepted message into the cached summary.
    /// Returns `false` when the document is absent so the caller can seed
    /// it from the durable store.
    pub async fn apply_message_meta(
        &self,
        chatroom_id: i64,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
    ) -> Result<bool, CacheError> {
        if self.breaker.is_open() {
            return Err(CacheError::unavailable("metadata circuit open"));
        }
        let applied = self
            .run(self.store.apply_message_meta(
                &room_key(chatroom_id),
                preview,
                at,
                sender_id,
                self.ttl,
            ))
            .await?;
        if applied {
            if let Err(e) = self.mark_dirty(chatroom_id).await {
                tracing::debug!(chatroom_id, error = %e, "failed to mark room dirty");
            }
        }
        Ok(applied)
    }

    /// Remembers a room whose cached metadata went stale while the cache
    /// tier was unreachable. The flush loop invalidates these once the tier
    /// is healthy again.
    pub fn queue_for_recovery(&self, chatroom_id: i64) {
        self.pending_recovery
            .lock()
            .expect("recovery set lock poisoned")
            .insert(chatroom_id);
    }

    pub fn pending_recovery(&self) -> Vec<i64> {
        self.pending_recovery
            .lock()
            .expect("recovery set lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Drops stale cache keys for a recovered room. Returns `true` once the
    /// room no longer needs recovery.
    pub async fn invalidate_room(&self, chatroom_id: i64) -> bool {
        if self.breaker.is_open() {
            return false;
        }
        match self.run(self.store.delete(&room_key(chatroom_id))).await {
            Ok(()) => {
                self.pending_recovery
                    .lock()
                    .expect("recovery set lock poisoned")
                    .remove(&chatroom_id);
                true
            }
            Err(e) => {
                tracing::debug!(chatroom_id, error = %e, "cache invalidation failed, will retry");
                false
            }
        }
    }

    async fn run<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let result = tokio::time::timeout(self.io_timeout, fut)
            .await
            .unwrap_or(Err(CacheError::Timeout {
                waited: self.io_timeout,
            }));
        self.breaker.observe(&result);
        result
    }
}
