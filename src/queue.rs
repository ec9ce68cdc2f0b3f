//! Sharded write queue.
//!
//! The fast-path write log: accepted messages are appended to a per-shard
//! FIFO in the cache tier and drained into the durable store by the flush
//! loop. All messages for one chatroom map to the same shard, so per-room
//! ordering needs no cross-shard coordination and shards can be flushed
//! independently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheError, CacheStore};
use crate::message::QueueEntry;

fn shard_key(shard: u32) -> String {
    format!("chat:write_queue:{shard}")
}

pub struct ShardedMessageQueue {
    store: Arc<dyn CacheStore>,
    shard_count: u32,
    io_timeout: Duration,
}

impl ShardedMessageQueue {
    pub fn new(store: Arc<dyn CacheStore>, shard_count: u32, io_timeout: Duration) -> Self {
        Self {
            store,
            shard_count: shard_count.max(1),
            io_timeout,
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_for(&self, chatroom_id: i64) -> u32 {
        chatroom_id.rem_euclid(i64::from(self.shard_count)) as u32
    }

    /// Appends an entry to the tail of its shard.
    ///
    /// This is the fast path's durability commitment point: failure must
    /// propagate so the caller can fall back to the durable store.
    pub async fn offer(&self, entry: &QueueEntry) -> Result<(), CacheError> {
        let shard = self.shard_for(entry.context.chatroom_id);
        let json = serde_json::to_string(entry).map_err(CacheError::corrupt)?;
        self.timed(self.store.push_front(&shard_key(shard), &json))
            .await
    }

    /// Removes up to `max_batch` entries from the head of the shard,
    /// oldest first. Entries that no longer deserialize are discarded here,
    /// with a log line, rather than poisoning every later flush attempt.
    pub async fn poll_batch(
        &self,
        shard: u32,
        max_batch: usize,
    ) -> Result<Vec<QueueEntry>, CacheError> {
        let key = shard_key(shard);
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            match self.timed(self.store.pop_back(&key)).await? {
                Some(json) => match serde_json::from_str::<QueueEntry>(&json) {
                    Ok(entry) => batch.push(entry),
                    Err(e) => {
                        tracing::error!(shard, error = %e, "discarding undecodable queue entry");
                    }
                },
                None => break,
            }
        }
        Ok(batch)
    }

    /// Reinserts a polled batch at the consumption head, preserving its
    /// original order, so a retry processes it before anything newer.
    pub async fn requeue(&self, shard: u32, batch: Vec<QueueEntry>) -> Result<(), CacheError> {
        let key = shard_key(shard);
        for entry in batch.into_iter().rev() {
            let json = serde_json::to_string(&entry).map_err(CacheError::corrupt)?;
            self.timed(self.store.push_back(&key, &json)).await?;
        }
        Ok(())
    }

    pub async fn depth(&self, shard: u32) -> Result<usize, CacheError> {
        self.timed(self.store.list_len(&shard_key(shard))).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::id::TsidFactory;
    use crate::message::MessageCreationContext;

    fn queue() -> ShardedMessageQueue {
        ShardedMessageQueue::new(Arc::new(MemoryStore::new()), 10, Duration::from_secs(1))
    }

    fn entry(ids: &TsidFactory, chatroom_id: i64, content: &str) -> QueueEntry {
        QueueEntry::new(MessageCreationContext {
            message_id: ids.generate(),
            chatroom_id,
            sender_id: 1,
            content: content.to_owned(),
            reply_to_id: None,
        })
    }

    #[tokio::test]
    async fn poll_preserves_offer_order() {
        let q = queue();
        let ids = TsidFactory::new(1);
        for content in ["a", "b", "c"] {
            q.offer(&entry(&ids, 42, content)).await.unwrap();
        }

        let batch = q.poll_batch(q.shard_for(42), 10).await.unwrap();
        let contents: Vec<_> = batch.iter().map(|e| e.context.content.as_str()).collect();
        assert_eq!(contents, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn poll_respects_the_batch_bound() {
        let q = queue();
        let ids = TsidFactory::new(1);
        for i in 0..5 {
            q.offer(&entry(&ids, 7, &i.to_string())).await.unwrap();
        }

        let shard = q.shard_for(7);
        assert_eq!(q.poll_batch(shard, 2).await.unwrap().len(), 2);
        assert_eq!(q.depth(shard).await.unwrap(), 3);
        assert_eq!(q.poll_batch(shard, 10).await.unwrap().len(), 3);
        assert!(q.poll_batch(shard, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeued_entries_run_again_before_newer_ones() {
        let q = queue();
        let ids = TsidFactory::new(1);
        for content in ["a", "b"] {
            q.offer(&entry(&ids, 3, content)).await.unwrap();
        }

        let shard = q.shard_for(3);
        let polled = q.poll_batch(shard, 10).await.unwrap();
        q.offer(&entry(&ids, 3, "c")).await.unwrap();
        q.requeue(shard, polled).await.unwrap();

        let drained = q.poll_batch(shard, 10).await.unwrap();
        let contents: Vec<_> = drained.iter().map(|e| e.context.content.as_str()).collect();
        assert_eq!(contents, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn rooms_stay_on_their_shard() {
        let q = queue();
        assert_eq!(q.shard_for(42), 2);
        assert_eq!(q.shard_for(42), q.shard_for(42));
        assert_eq!(q.shard_for(10), 0);
    }
}
