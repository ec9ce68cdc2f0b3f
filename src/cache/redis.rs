//! Redis-backed cache store.
//!
//! The production cache tier: queue shards and room history are Redis
//! lists, the dirty-room working set is a Redis set, and the two metadata
//! document updates run as Lua scripts so a message arrival and a read
//! receipt racing on the same key cannot lose each other's fields.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{CacheError, CacheStore};

// KEYS[1] = metadata document; ARGV = user id, read time, ttl seconds.
// Returns 0 when the document is absent or the user is not a member.
const READ_STATUS_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local doc = cjson.decode(raw)
local user = tonumber(ARGV[1])
local slot
if doc.member1_id == user then slot = 'mem1_last_read_at'
elseif doc.member2_id == user then slot = 'mem2_last_read_at'
else return 0 end
local current = doc[slot]
if current == cjson.null or current == nil or current <= ARGV[2] then
    doc[slot] = ARGV[2]
end
redis.call('SET', KEYS[1], cjson.encode(doc), 'EX', ARGV[3])
return 1
"#;

// KEYS[1] = metadata document; ARGV = preview, message time, sender id,
// ttl seconds. The summary only ever advances by message timestamp.
const MESSAGE_META_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local doc = cjson.decode(raw)
local current = doc.last_message_at
if current == cjson.null or current == nil or current <= ARGV[2] then
    doc.last_message_at = ARGV[2]
    doc.last_message_preview = ARGV[1]
end
local sender = tonumber(ARGV[3])
local slot
if doc.member1_id == sender then slot = 'mem1_last_read_at'
elseif doc.member2_id == sender then slot = 'mem2_last_read_at' end
if slot then
    local read = doc[slot]
    if read == cjson.null or read == nil or read <= ARGV[2] then
        doc[slot] = ARGV[2]
    end
end
redis.call('SET', KEYS[1], cjson.encode(doc), 'EX', ARGV[4])
return 1
"#;

pub struct RedisStore {
    manager: ConnectionManager,
    read_status: Script,
    message_meta: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::unavailable)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(CacheError::unavailable)?;
        Ok(Self {
            manager,
            read_status: Script::new(READ_STATUS_LUA),
            message_meta: Script::new(MESSAGE_META_LUA),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn map_err(e: redis::RedisError) -> CacheError {
    if e.is_timeout() {
        CacheError::Timeout {
            waited: Duration::ZERO,
        }
    } else {
        CacheError::unavailable(e)
    }
}

fn fmt_time(at: DateTime<Utc>) -> String {
    // Same fixed width the serialized metadata document uses, so the
    // scripts' lexicographic comparisons stay chronological.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.conn().get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set(key, value).await.map_err(map_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.conn().del(key).await.map_err(map_err)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.conn().exists(key).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.conn()
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(map_err)
    }

    async fn push_front(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.conn().lpush(key, value).await.map_err(map_err)
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.conn().rpush(key, value).await.map_err(map_err)
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.conn().rpop(key, None).await.map_err(map_err)
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, CacheError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = (start + count - 1) as isize;
        self.conn()
            .lrange(key, start as isize, stop)
            .await
            .map_err(map_err)
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), CacheError> {
        let mut conn = self.conn();
        if max_len == 0 {
            return conn.del(key).await.map_err(map_err);
        }
        conn.ltrim(key, 0, max_len as isize - 1).await.map_err(map_err)
    }

    async fn list_len(&self, key: &str) -> Result<usize, CacheError> {
        self.conn().llen(key).await.map_err(map_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), CacheError> {
        self.conn().sadd(key, member).await.map_err(map_err)
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.conn().spop(key).await.map_err(map_err)
    }

    async fn apply_read_status(
        &self,
        key: &str,
        user_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let applied: i64 = self
            .read_status
            .key(key)
            .arg(user_id)
            .arg(fmt_time(at))
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(applied == 1)
    }

    async fn apply_message_meta(
        &self,
        key: &str,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        let applied: i64 = self
            .message_meta
            .key(key)
            .arg(preview)
            .arg(fmt_time(at))
            .arg(sender_id)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(applied == 1)
    }
}
