//! Recent-message cache.
//!
//! Keeps the newest messages of each room in the cache tier so first-page
//! history reads avoid the durable store. A room is only served from here
//! once its warmed marker is set, which happens after a durable-store read
//! has been merged back; otherwise a half-filled list would masquerade as
//! the full first page.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheError, CacheStore};
use crate::message::StoredMessage;

fn history_key(chatroom_id: i64) -> String {
    format!("chat:room:{chatroom_id}:history")
}

fn warmed_key(chatroom_id: i64) -> String {
    format!("chat:room:{chatroom_id}:warmed")
}

pub struct HistoryCache {
    store: Arc<dyn CacheStore>,
    limit: usize,
    ttl: Duration,
    io_timeout: Duration,
}

impl HistoryCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        limit: usize,
        ttl: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            limit,
            ttl,
            io_timeout,
        }
    }

    /// Appends a freshly accepted message and trims the room's window.
    pub async fn push_recent(&self, message: &StoredMessage) -> Result<(), CacheError> {
        let key = history_key(message.chatroom_id);
        let json = serde_json::to_string(message).map_err(CacheError::corrupt)?;
        self.timed(self.store.push_front(&key, &json)).await?;
        self.timed(self.store.list_trim(&key, self.limit)).await?;
        self.timed(self.store.expire(&key, self.ttl)).await
    }

    pub async fn is_warmed(&self, chatroom_id: i64) -> Result<bool, CacheError> {
        self.timed(self.store.exists(&warmed_key(chatroom_id))).await
    }

    /// The newest cached messages, chronologically ordered. Entries that no
    /// longer decode are skipped with a log line.
    pub async fn recent(
        &self,
        chatroom_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, CacheError> {
        let raw = self
            .timed(self.store.list_range(&history_key(chatroom_id), 0, limit))
            .await?;
        let mut messages: Vec<StoredMessage> = raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(chatroom_id, error = %e, "skipping malformed cached message");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m: &StoredMessage| m.message_id);
        Ok(messages)
    }

    /// Replaces the room's window with a durable-store read and sets the
    /// warmed marker. The marker goes last: it is the authority bit.
    pub async fn warm_up(
        &self,
        chatroom_id: i64,
        messages: &[StoredMessage],
    ) -> Result<(), CacheError> {
        let key = history_key(chatroom_id);
        self.timed(self.store.delete(&key)).await?;

        let mut newest_first: Vec<&StoredMessage> = messages.iter().collect();
        newest_first.sort_by_key(|m| std::cmp::Reverse(m.message_id));
        for message in newest_first.into_iter().take(self.limit).rev() {
            let json = serde_json::to_string(message).map_err(CacheError::corrupt)?;
            self.timed(self.store.push_front(&key, &json)).await?;
        }
        self.timed(self.store.expire(&key, self.ttl)).await?;
        self.timed(
            self.store
                .set(&warmed_key(chatroom_id), "1", Some(self.ttl)),
        )
        .await
    }

    pub async fn invalidate(&self, chatroom_id: i64) -> Result<(), CacheError> {
        self.timed(self.store.delete(&history_key(chatroom_id))).await?;
        self.timed(self.store.delete(&warmed_key(chatroom_id))).await
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .unwrap_or(Err(CacheError::Timeout {
                waited: self.io_timeout,
            }))
    }
}
