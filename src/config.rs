use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, loaded from `DOVECOTE_`-prefixed environment
/// variables. Every tunable of the durability pipeline lives here so
/// deployments never patch constants in code.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// SQLite database path. `None` selects an in-memory database.
    pub db_path: Option<String>,

    /// Redis connection URL for the cache tier. `None` selects the
    /// in-process memory store.
    pub cache_url: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Number of write-queue shards. Messages for one chatroom always land
    /// in the same shard, which is what preserves per-room ordering.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Max messages drained from one shard per flush tick.
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Overall deadline for a single flush tick. Checked between shards so
    /// one tick cannot run unbounded.
    #[serde(default = "default_flush_tick_deadline_ms")]
    pub flush_tick_deadline_ms: u64,

    /// Max dirty rooms reconciled per flush tick.
    #[serde(default = "default_metadata_sync_batch_size")]
    pub metadata_sync_batch_size: usize,

    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// How many recent messages per room are kept in the cache tier.
    #[serde(default = "default_history_cache_limit")]
    pub history_cache_limit: usize,

    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// Char budget for `last_message_preview`.
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,

    /// Bound on any single cache-tier operation. A timeout counts as a
    /// failure for circuit-breaker purposes.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// How many flush attempts a queue entry gets before it is discarded as
    /// a poison message.
    #[serde(default = "default_poison_retry_limit")]
    pub poison_retry_limit: u32,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_shard_count() -> u32 {
    10
}

fn default_flush_batch_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_flush_tick_deadline_ms() -> u64 {
    5000
}

fn default_metadata_sync_batch_size() -> usize {
    50
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_history_cache_limit() -> usize {
    50
}

fn default_history_page_size() -> usize {
    50
}

fn default_preview_max_chars() -> usize {
    200
}

fn default_io_timeout_ms() -> u64 {
    2000
}

fn default_poison_retry_limit() -> u32 {
    3
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("DOVECOTE_").from_env::<Self>()?)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_tick_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_tick_deadline_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            cache_url: None,
            listen_addr: default_listen_addr(),
            shard_count: default_shard_count(),
            flush_batch_size: default_flush_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_tick_deadline_ms: default_flush_tick_deadline_ms(),
            metadata_sync_batch_size: default_metadata_sync_batch_size(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            history_cache_limit: default_history_cache_limit(),
            history_page_size: default_history_page_size(),
            preview_max_chars: default_preview_max_chars(),
            io_timeout_ms: default_io_timeout_ms(),
            poison_retry_limit: default_poison_retry_limit(),
        }
    }
}
