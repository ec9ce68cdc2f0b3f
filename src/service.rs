//! Domain facade for the chat durability pipeline.
//!
//! The only entry point the rest of the system sees: callers get `save`,
//! `fetch_history` and the read-receipt/room operations, and never learn
//! which tier served them. Path selection, circuit breaking and the flush
//! loop all live behind this type.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::cache::memory::MemoryStore;
use crate::cache::redis::RedisStore;
use crate::cache::CacheStore;
use crate::chatroom::ChatRoomMetadata;
use crate::config::Config;
use crate::error::Error;
use crate::history::HistoryCache;
use crate::id::{MessageId, TsidFactory};
use crate::message::{MessageCreationContext, StoredMessage};
use crate::metadata::MetadataCache;
use crate::persistence::PersistenceManager;
use crate::queue::ShardedMessageQueue;
use crate::retrieval::RetrievalManager;

pub struct Service {
    db: SqlitePool,
    config: Config,
    ids: TsidFactory,
    metadata: Arc<MetadataCache>,
    persistence: Arc<PersistenceManager>,
    retrieval: Arc<RetrievalManager>,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let store: Arc<dyn CacheStore> = match &config.cache_url {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Self::connect_with_store(config, store).await
    }

    /// Wires the pipeline around an explicit cache handle. The cache tier's
    /// lifecycle belongs to this subsystem, which is also what lets tests
    /// inject deterministic or failure-injecting stores.
    pub async fn connect_with_store(
        config: Config,
        store: Arc<dyn CacheStore>,
    ) -> eyre::Result<Self> {
        let opts = if let Some(path) = &config.db_path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        let pool_opts = if config.db_path.is_some() {
            SqlitePoolOptions::new()
        } else {
            // A pooled in-memory database is one database per connection;
            // pin the pool to a single connection instead.
            SqlitePoolOptions::new().max_connections(1)
        };
        let pool = pool_opts.connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let metadata = Arc::new(MetadataCache::new(
            Arc::clone(&store),
            CircuitBreaker::new(
                "metadata",
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
            config.cache_ttl(),
            config.io_timeout(),
        ));
        let history = Arc::new(HistoryCache::new(
            Arc::clone(&store),
            config.history_cache_limit,
            config.cache_ttl(),
            config.io_timeout(),
        ));
        let queue = ShardedMessageQueue::new(
            Arc::clone(&store),
            config.shard_count,
            config.io_timeout(),
        );

        let persistence = Arc::new(PersistenceManager::new(
            pool.clone(),
            queue,
            Arc::clone(&metadata),
            Arc::clone(&history),
            CircuitBreaker::new(
                "message-write",
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
            config.flush_batch_size,
            config.metadata_sync_batch_size,
            config.preview_max_chars,
            config.poison_retry_limit,
            config.flush_tick_deadline(),
        ));
        let retrieval = Arc::new(RetrievalManager::new(
            pool.clone(),
            history,
            CircuitBreaker::new(
                "message-read",
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
        ));

        Ok(Self {
            db: pool,
            config,
            ids: TsidFactory::from_random_node(),
            metadata,
            persistence,
            retrieval,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the immutable write context for a new message, assigning its
    /// id up front so retries through either path stay idempotent.
    pub fn create_context(
        &self,
        chatroom_id: i64,
        sender_id: i64,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> MessageCreationContext {
        MessageCreationContext {
            message_id: self.ids.generate(),
            chatroom_id,
            sender_id,
            content,
            reply_to_id,
        }
    }

    pub async fn send_message(
        &self,
        chatroom_id: i64,
        sender_id: i64,
        content: String,
        reply_to_id: Option<MessageId>,
    ) -> Result<StoredMessage, Error> {
        let context = self.create_context(chatroom_id, sender_id, content, reply_to_id);
        self.save(context).await
    }

    /// Persists a message with high availability: fast path first, durable
    /// fallback second. An error here means BOTH paths failed and the
    /// message was not accepted.
    pub async fn save(&self, context: MessageCreationContext) -> Result<StoredMessage, Error> {
        context.validate()?;

        match self.persistence.dispatch_write(&context).await {
            Ok(stored) => Ok(stored),
            Err(fast_err) => {
                tracing::warn!(
                    message_id = %context.message_id,
                    error = %fast_err,
                    "fast path failed, falling back to durable store"
                );
                self.persistence
                    .fallback_write(&context)
                    .await
                    .map_err(|fallback_err| match fallback_err {
                        // The caller's data problem, not an availability one.
                        e @ (Error::DataIntegrity { .. }
                        | Error::Validation { .. }
                        | Error::NotFound { .. }) => e,
                        e => {
                            tracing::error!(
                                message_id = %context.message_id,
                                error = %e,
                                "fallback write failed, message not accepted"
                            );
                            Error::unavailable(e)
                        }
                    })
            }
        }
    }

    /// A page of room history, oldest first. Storage failures degrade to an
    /// empty page: a transiently blank history is less harmful than an
    /// error surfacing to every open chat window.
    pub async fn fetch_history(
        &self,
        chatroom_id: i64,
        page: usize,
        size: Option<usize>,
    ) -> Vec<StoredMessage> {
        let size = size.unwrap_or(self.config.history_page_size);
        match self.retrieval.fetch_history(chatroom_id, page, size).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(chatroom_id, error = %e, "history retrieval failed, returning empty page");
                Vec::new()
            }
        }
    }

    pub async fn find_message(&self, message_id: MessageId) -> Option<StoredMessage> {
        match self.retrieval.find_by_id(message_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(%message_id, error = %e, "message lookup failed");
                None
            }
        }
    }

    pub async fn find_messages(&self, message_ids: &[MessageId]) -> Vec<StoredMessage> {
        match self.retrieval.find_all_by_id(message_ids).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "batched message lookup failed");
                Vec::new()
            }
        }
    }

    /// Records that `user_id` has read the room up to now. Prefers the
    /// atomic cache update (reconciled later by the flush loop); writes
    /// through to the durable store when the cache cannot take it.
    pub async fn mark_read(&self, chatroom_id: i64, user_id: i64) -> Result<(), Error> {
        let now = Utc::now();
        if self.metadata.apply_read_status(chatroom_id, user_id, now).await {
            return Ok(());
        }

        let mut conn = self.db.acquire().await?;
        if ChatRoomMetadata::apply_read_update(&mut conn, chatroom_id, user_id, now).await? {
            Ok(())
        } else {
            Err(Error::not_found(format!(
                "member {user_id} in chatroom {chatroom_id}"
            )))
        }
    }

    pub async fn room_metadata(&self, chatroom_id: i64) -> Result<ChatRoomMetadata, Error> {
        if let Some(meta) = self.metadata.get(chatroom_id).await {
            return Ok(meta);
        }

        let mut conn = self.db.acquire().await?;
        match ChatRoomMetadata::find(&mut conn, chatroom_id).await? {
            Some(meta) => {
                self.metadata.put(&meta).await;
                Ok(meta)
            }
            None => Err(Error::room_not_found(chatroom_id)),
        }
    }

    /// Finds or creates the room for a member pair.
    pub async fn register_room(
        &self,
        member_a: i64,
        member_b: i64,
    ) -> Result<ChatRoomMetadata, Error> {
        if member_a <= 0 || member_b <= 0 || member_a == member_b {
            return Err(Error::validation("a room needs two distinct members"));
        }
        let mut conn = self.db.acquire().await?;
        ChatRoomMetadata::ensure(&mut conn, member_a, member_b).await
    }

    /// Per-shard backlog depths, for observability.
    pub async fn queue_depths(&self) -> Vec<usize> {
        let queue = self.persistence.queue();
        let mut depths = Vec::with_capacity(queue.shard_count() as usize);
        for shard in 0..queue.shard_count() {
            depths.push(queue.depth(shard).await.unwrap_or(0));
        }
        depths
    }

    /// Runs one flush pass immediately, outside the periodic schedule.
    pub async fn flush_now(&self) {
        self.persistence.flush_tick().await;
    }

    pub fn write_breaker(&self) -> &CircuitBreaker {
        self.persistence.breaker()
    }

    pub fn read_breaker(&self) -> &CircuitBreaker {
        self.retrieval.breaker()
    }

    pub fn metadata_breaker(&self) -> &CircuitBreaker {
        self.metadata.breaker()
    }

    /// Starts the periodic flush task. The task belongs to this subsystem:
    /// it starts here and stops when the returned handle is shut down.
    pub fn start_flush_loop(&self) -> FlushHandle {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let persistence = Arc::clone(&self.persistence);
        let period = self.config.flush_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => persistence.flush_tick().await,
                }
            }
            tracing::info!("flush loop stopped");
        });

        FlushHandle { token, handle }
    }
}

/// Owns the background flush task's lifecycle.
pub struct FlushHandle {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl FlushHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "flush loop did not shut down cleanly");
        }
    }
}
