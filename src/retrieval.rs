//! Read path for message history.
//!
//! Cache-first for the first page, durable store otherwise, with a
//! fire-and-forget write-back that warms the cache after a durable read.
//! Owns its own circuit breaker so read-side cache failures never affect
//! write availability.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::breaker::CircuitBreaker;
use crate::error::Error;
use crate::history::HistoryCache;
use crate::id::MessageId;
use crate::message::StoredMessage;

pub struct RetrievalManager {
    db: SqlitePool,
    history: Arc<HistoryCache>,
    breaker: CircuitBreaker,
}

impl RetrievalManager {
    pub fn new(db: SqlitePool, history: Arc<HistoryCache>, breaker: CircuitBreaker) -> Self {
        Self {
            db,
            history,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// A page of room history in chronological order.
    ///
    /// Only the first page can be served from the cache tier, and only once
    /// the room's window has been warmed; everything else reads the durable
    /// store newest-first and re-orders before returning.
    pub async fn fetch_history(
        self: &Arc<Self>,
        chatroom_id: i64,
        page: usize,
        size: usize,
    ) -> Result<Vec<StoredMessage>, Error> {
        if page == 0 {
            if let Some(cached) = self.read_cached(chatroom_id, size).await {
                tracing::debug!(chatroom_id, count = cached.len(), "history cache hit");
                return Ok(cached);
            }
        }

        let mut conn = self.db.acquire().await?;
        let mut rows = StoredMessage::find_latest(&mut conn, chatroom_id, page, size).await?;
        rows.reverse();

        if page == 0 && !rows.is_empty() {
            self.spawn_warm_up(chatroom_id, rows.clone());
        }

        Ok(rows)
    }

    pub async fn find_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>, Error> {
        let mut conn = self.db.acquire().await?;
        StoredMessage::find_by_id(&mut conn, message_id).await
    }

    pub async fn find_all_by_id(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredMessage>, Error> {
        let mut conn = self.db.acquire().await?;
        StoredMessage::find_all_by_id(&mut conn, message_ids).await
    }

    /// The cached first page, or `None` when the cache cannot serve it
    /// (circuit open, unwarmed room, tier failure).
    async fn read_cached(&self, chatroom_id: i64, size: usize) -> Option<Vec<StoredMessage>> {
        if self.breaker.is_open() {
            tracing::debug!(chatroom_id, "read circuit open, going to durable store");
            return None;
        }

        let warmed = self.history.is_warmed(chatroom_id).await;
        self.breaker.observe(&warmed);
        if !warmed.unwrap_or(false) {
            return None;
        }

        let cached = self.history.recent(chatroom_id, size).await;
        self.breaker.observe(&cached);
        match cached {
            Ok(mut messages) => {
                // The window may hold more than one page; keep the newest.
                if messages.len() > size {
                    let excess = messages.len() - size;
                    messages.drain(..excess);
                }
                Some(messages)
            }
            Err(e) => {
                tracing::debug!(chatroom_id, error = %e, "history cache read failed");
                None
            }
        }
    }

    /// Write-back after a durable first-page read; fire and forget.
    fn spawn_warm_up(self: &Arc<Self>, chatroom_id: i64, messages: Vec<StoredMessage>) {
        if self.breaker.is_open() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(chatroom_id, count = messages.len(), "warming history cache");
            let warmed = this.history.warm_up(chatroom_id, &messages).await;
            this.breaker.observe(&warmed);
            if let Err(e) = warmed {
                tracing::debug!(chatroom_id, error = %e, "history warm-up failed, skipping");
            }
        });
    }
}
