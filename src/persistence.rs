//! Write dispatch and the background flush loop.
//!
//! The dual-path write strategy lives here. Normal operation buffers each
//! accepted message in a queue shard (the fast path) and the flush loop
//! drains shards into the durable store once a second. When the cache tier
//! misbehaves, the write circuit opens and every save goes straight through
//! the synchronous durable fallback until a probe shows the tier recovered.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Acquire, SqlitePool};
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::cache::CacheError;
use crate::chatroom::ChatRoomMetadata;
use crate::error::Error;
use crate::history::HistoryCache;
use crate::message::{truncate_preview, MessageCreationContext, QueueEntry, StoredMessage};
use crate::metadata::MetadataCache;
use crate::queue::ShardedMessageQueue;

pub struct PersistenceManager {
    db: SqlitePool,
    queue: ShardedMessageQueue,
    metadata: Arc<MetadataCache>,
    history: Arc<HistoryCache>,
    breaker: CircuitBreaker,
    flush_batch_size: usize,
    metadata_sync_batch_size: usize,
    preview_max_chars: usize,
    poison_retry_limit: u32,
    tick_deadline: Duration,
}

impl PersistenceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: SqlitePool,
        queue: ShardedMessageQueue,
        metadata: Arc<MetadataCache>,
        history: Arc<HistoryCache>,
        breaker: CircuitBreaker,
        flush_batch_size: usize,
        metadata_sync_batch_size: usize,
        preview_max_chars: usize,
        poison_retry_limit: u32,
        tick_deadline: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            metadata,
            history,
            breaker,
            flush_batch_size,
            metadata_sync_batch_size,
            preview_max_chars,
            poison_retry_limit,
            tick_deadline,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &ShardedMessageQueue {
        &self.queue
    }

    /// Fast-path write: buffer the message in its queue shard.
    ///
    /// The enqueue is the durability commitment point: it either succeeds
    /// or errors so the caller can fall back. The cache metadata updates
    /// that follow are best effort and never fail the write.
    pub async fn dispatch_write(
        &self,
        context: &MessageCreationContext,
    ) -> Result<StoredMessage, Error> {
        if self.breaker.is_open() {
            // Fail fast: do not pay the I/O timeout when the tier is known
            // to be down.
            return Err(Error::Connectivity {
                source: CacheError::unavailable("write circuit open"),
            });
        }

        let entry = QueueEntry::new(context.clone());
        let offered = self.queue.offer(&entry).await;
        self.breaker.observe(&offered);
        offered?;

        let stored = context.to_stored();

        if let Err(e) = self.history.push_recent(&stored).await {
            tracing::debug!(
                chatroom_id = stored.chatroom_id,
                error = %e,
                "history cache update skipped"
            );
        }
        self.sync_room_cache(&stored).await;

        Ok(stored)
    }

    /// Slow-path write: one transaction covering the message row and the
    /// room's metadata update. No dependency on the cache tier.
    pub async fn fallback_write(
        &self,
        context: &MessageCreationContext,
    ) -> Result<StoredMessage, Error> {
        let stored = context.to_stored();
        let preview = truncate_preview(&stored.content, self.preview_max_chars);

        let mut tx = self.db.begin().await?;
        stored.insert(tx.acquire().await?).await?;
        ChatRoomMetadata::apply_message_update(
            tx.acquire().await?,
            stored.chatroom_id,
            &preview,
            stored.created_at,
            stored.sender_id,
        )
        .await?;
        tx.commit().await?;

        // The cache tier was bypassed; whatever it holds for this room is
        // now stale and must be dropped once the tier heals.
        self.metadata.queue_for_recovery(stored.chatroom_id);

        Ok(stored)
    }

    /// One pass of the background flush: recover stale cache entries, drain
    /// queue shards, reconcile dirty metadata.
    pub async fn flush_tick(&self) {
        let deadline = Instant::now() + self.tick_deadline;

        self.recover_stale_rooms().await;

        for shard in 0..self.queue.shard_count() {
            if Instant::now() >= deadline {
                tracing::warn!(shard, "flush tick deadline reached, deferring remaining shards");
                break;
            }
            if self.breaker.is_open() {
                tracing::debug!("flush blocked by write circuit, skipping remaining shards");
                break;
            }
            if let Err(e) = self.flush_shard(shard).await {
                // A stalled backend should not be hammered shard after
                // shard within the same tick.
                tracing::debug!(shard, error = %e, "shard flush failed, stopping this tick");
                break;
            }
        }

        self.flush_dirty_metadata().await;
    }

    /// Invalidate cache keys for rooms written through the fallback while
    /// the tier was down. Piggybacked on the flush tick so recovery needs
    /// no extra scheduling.
    async fn recover_stale_rooms(&self) {
        if self.metadata.breaker().is_open() {
            return;
        }
        for chatroom_id in self.metadata.pending_recovery() {
            if self.metadata.invalidate_room(chatroom_id).await {
                if let Err(e) = self.history.invalidate(chatroom_id).await {
                    tracing::debug!(chatroom_id, error = %e, "history invalidation failed, will retry");
                    self.metadata.queue_for_recovery(chatroom_id);
                } else {
                    tracing::info!(chatroom_id, "invalidated stale cache after recovery");
                }
            }
        }
    }

    async fn flush_shard(&self, shard: u32) -> Result<(), Error> {
        let polled = self.queue.poll_batch(shard, self.flush_batch_size).await;
        self.breaker.observe(&polled);
        let batch = polled?;
        if batch.is_empty() {
            return Ok(());
        }

        match self.insert_batch(&batch).await {
            Ok(()) => {
                tracing::info!(shard, count = batch.len(), "flushed shard to durable store");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    shard,
                    error = %e,
                    "bulk flush failed, falling back to granular processing"
                );
                self.flush_granular(shard, batch).await
            }
        }
    }

    /// Bulk insert of a polled batch in a single transaction.
    async fn insert_batch(&self, batch: &[QueueEntry]) -> Result<(), Error> {
        let mut tx = self.db.begin().await?;
        for entry in batch {
            entry.context.to_stored().insert(tx.acquire().await?).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Per-entry retry pass that isolates poison messages. Data-integrity
    /// failures count against the entry's attempt budget; transient
    /// failures requeue the entry unchanged, ahead of newer entries.
    async fn flush_granular(&self, shard: u32, batch: Vec<QueueEntry>) -> Result<(), Error> {
        let mut to_requeue = Vec::new();
        let mut stop: Option<Error> = None;

        for mut entry in batch {
            if stop.is_some() {
                // The backend already proved unhealthy this pass; put the
                // rest back untouched.
                to_requeue.push(entry);
                continue;
            }

            let result = async {
                let mut conn = self.db.acquire().await?;
                entry.context.to_stored().insert(&mut conn).await
            }
            .await;

            match result {
                Ok(_) => {}
                Err(Error::DataIntegrity { message }) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.poison_retry_limit {
                        tracing::error!(
                            shard,
                            message_id = %entry.context.message_id,
                            attempts = entry.attempts,
                            error = %message,
                            "discarding poison message"
                        );
                    } else {
                        tracing::warn!(
                            shard,
                            message_id = %entry.context.message_id,
                            attempts = entry.attempts,
                            error = %message,
                            "data error on flush, will retry"
                        );
                        to_requeue.push(entry);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        shard,
                        message_id = %entry.context.message_id,
                        error = %e,
                        "transient flush failure, requeueing"
                    );
                    to_requeue.push(entry);
                    stop = Some(e);
                }
            }
        }

        if !to_requeue.is_empty() {
            if let Err(e) = self.queue.requeue(shard, to_requeue.clone()).await {
                tracing::warn!(shard, error = %e, "requeue failed, attempting durable rescue");
                let requeue_result: Result<(), CacheError> = Err(e);
                self.breaker.observe(&requeue_result);
                // Requeue failed with entries already polled out: the
                // durable store is their last chance.
                for entry in to_requeue {
                    let mut conn = match self.db.acquire().await {
                        Ok(conn) => conn,
                        Err(rescue_err) => {
                            tracing::error!(
                                shard,
                                message_id = %entry.context.message_id,
                                error = %rescue_err,
                                "MESSAGE LOST: requeue and durable rescue both failed"
                            );
                            continue;
                        }
                    };
                    if let Err(rescue_err) = entry.context.to_stored().insert(&mut conn).await {
                        tracing::error!(
                            shard,
                            message_id = %entry.context.message_id,
                            error = %rescue_err,
                            "MESSAGE LOST: requeue and durable rescue both failed"
                        );
                    }
                }
            }
        }

        match stop {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reconcile a bounded number of dirty rooms from the cache into the
    /// durable store. A room whose cached document has vanished is skipped;
    /// the next message write corrects it.
    async fn flush_dirty_metadata(&self) {
        let mut rooms = Vec::new();
        for _ in 0..self.metadata_sync_batch_size {
            match self.metadata.pop_dirty().await {
                Some(chatroom_id) if !rooms.contains(&chatroom_id) => rooms.push(chatroom_id),
                Some(_) => {}
                None => break,
            }
        }
        if rooms.is_empty() {
            return;
        }

        let mut documents = Vec::new();
        for &chatroom_id in &rooms {
            match self.metadata.get(chatroom_id).await {
                Some(meta) => documents.push(meta),
                None => {
                    tracing::debug!(
                        chatroom_id,
                        "dirty room has no cached metadata, skipping"
                    );
                }
            }
        }
        if documents.is_empty() {
            return;
        }

        let synced: Result<(), Error> = async {
            let mut tx = self.db.begin().await?;
            for meta in &documents {
                meta.sync_from_cache(tx.acquire().await?).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match synced {
            Ok(()) => {
                tracing::debug!(count = documents.len(), "reconciled dirty room metadata");
            }
            Err(e) => {
                tracing::warn!(error = %e, "metadata reconciliation failed, re-marking rooms");
                for meta in &documents {
                    if let Err(mark_err) = self.metadata.mark_dirty(meta.chatroom_id).await {
                        tracing::debug!(
                            chatroom_id = meta.chatroom_id,
                            error = %mark_err,
                            "failed to re-mark dirty room"
                        );
                    }
                }
            }
        }
    }

    /// Best-effort cache metadata update after a fast-path accept. Seeds
    /// the document from the durable store on a cold room.
    async fn sync_room_cache(&self, stored: &StoredMessage) {
        let preview = truncate_preview(&stored.content, self.preview_max_chars);
        match self
            .metadata
            .apply_message_meta(
                stored.chatroom_id,
                &preview,
                stored.created_at,
                stored.sender_id,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let loaded: Result<Option<ChatRoomMetadata>, Error> = async {
                    let mut conn = self.db.acquire().await?;
                    ChatRoomMetadata::find(&mut conn, stored.chatroom_id).await
                }
                .await;
                match loaded {
                    Ok(Some(mut meta)) => {
                        meta.apply_message(&preview, stored.created_at, stored.sender_id);
                        self.metadata.put(&meta).await;
                        if let Err(e) = self.metadata.mark_dirty(stored.chatroom_id).await {
                            tracing::debug!(
                                chatroom_id = stored.chatroom_id,
                                error = %e,
                                "failed to mark seeded room dirty"
                            );
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(
                            chatroom_id = stored.chatroom_id,
                            "room not in durable store yet, metadata cache stays cold"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            chatroom_id = stored.chatroom_id,
                            error = %e,
                            "failed to seed metadata cache"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    chatroom_id = stored.chatroom_id,
                    error = %e,
                    "cache metadata update skipped"
                );
            }
        }
    }
}
