use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use dovecote::breaker::CircuitState;
use dovecote::cache::memory::MemoryStore;
use dovecote::cache::{CacheError, CacheStore};
use dovecote::config::Config;
use dovecote::error::Error;
use dovecote::service::Service;

/// Memory-backed store with a kill switch, for driving the pipeline through
/// a cache-tier outage.
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::unavailable("injected outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn push_front(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.push_front(key, value).await
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.push_back(key, value).await
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        self.inner.pop_back(key).await
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, CacheError> {
        self.check()?;
        self.inner.list_range(key, start, count).await
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), CacheError> {
        self.check()?;
        self.inner.list_trim(key, max_len).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.list_len(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set_add(key, member).await
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        self.inner.set_pop(key).await
    }

    async fn apply_read_status(
        &self,
        key: &str,
        user_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check()?;
        self.inner.apply_read_status(key, user_id, at, ttl).await
    }

    async fn apply_message_meta(
        &self,
        key: &str,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check()?;
        self.inner
            .apply_message_meta(key, preview, at, sender_id, ttl)
            .await
    }
}

struct TmpService {
    svc: Service,
    store: Arc<FlakyStore>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> TmpService {
    let path = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::new());

    let config = Config {
        db_path: Some(path.path().join("dovecote.db").to_string_lossy().to_string()),
        breaker_cooldown_ms: 60_000,
        ..Config::default()
    };

    TmpService {
        svc: Service::connect_with_store(config, Arc::clone(&store) as Arc<dyn CacheStore>)
            .await
            .unwrap(),
        store,
        tmpdir: path,
    }
}

#[tokio::test]
async fn history_arrives_in_send_order_after_a_flush() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    let a = service
        .send_message(room, 1, "A".into(), None)
        .await
        .unwrap();
    let b = service
        .send_message(room, 2, "B".into(), None)
        .await
        .unwrap();
    let c = service
        .send_message(room, 1, "C".into(), None)
        .await
        .unwrap();
    assert!(a.message_id < b.message_id && b.message_id < c.message_id);

    // All three are buffered on the room's shard, nothing durable yet.
    let depths = service.queue_depths().await;
    assert_eq!(depths.iter().sum::<usize>(), 3);

    service.flush_now().await;

    assert_eq!(service.queue_depths().await.iter().sum::<usize>(), 0);
    let history = service.fetch_history(room, 0, Some(10)).await;
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["A", "B", "C"]);
}

#[tokio::test]
async fn metadata_follows_the_latest_message() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    let last = service
        .send_message(room, 2, "see you tomorrow".into(), None)
        .await
        .unwrap();
    service.flush_now().await;

    let meta = service.room_metadata(room).await.unwrap();
    assert_eq!(
        meta.last_message_preview.as_deref(),
        Some("see you tomorrow")
    );
    assert_eq!(meta.last_message_at, Some(last.created_at));
    // The sender has implicitly read their own message.
    assert_eq!(meta.mem2_last_read_at, Some(last.created_at));
}

#[tokio::test]
async fn retried_context_stores_exactly_one_row() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    let context = service.create_context(room, 1, "exactly once".into(), None);

    // First attempt lands on the fast path.
    service.save(context.clone()).await.unwrap();

    // The cache tier dies before the caller sees the outcome; the retry
    // goes through the durable fallback while the queue entry is pending.
    service.store.set_down(true);
    service.save(context.clone()).await.unwrap();
    assert_eq!(service.write_breaker().state(), CircuitState::Open);

    service.store.set_down(false);
    service.write_breaker().record_success();
    service.flush_now().await;

    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "exactly once");
}

#[tokio::test]
async fn outage_falls_back_to_a_synchronous_durable_write() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service.store.set_down(true);
    let stored = service
        .send_message(room, 1, "D".into(), None)
        .await
        .unwrap();

    // One connectivity failure is enough to open the circuit.
    assert_eq!(service.write_breaker().state(), CircuitState::Open);

    service.store.set_down(false);

    // No queue entry was written; the message is already durable and reads
    // reflect it before any flush runs.
    assert_eq!(service.queue_depths().await.iter().sum::<usize>(), 0);
    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message_id, stored.message_id);

    let meta = service.room_metadata(room).await.unwrap();
    assert_eq!(meta.last_message_preview.as_deref(), Some("D"));
}

#[tokio::test]
async fn save_surfaces_an_error_only_when_both_paths_fail() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service.store.set_down(true);
    service.db().close().await;

    let err = service
        .send_message(room, 1, "doomed".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));
}

#[tokio::test]
async fn cache_outage_opens_the_read_circuit_but_durable_reads_continue() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service
        .send_message(room, 1, "durable".into(), None)
        .await
        .unwrap();
    service.flush_now().await;

    service.store.set_down(true);
    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history.len(), 1);

    // One unreachable-tier failure opens the read circuit, and only the
    // read circuit: the write boundary's failure domain is isolated.
    assert_eq!(service.read_breaker().state(), CircuitState::Open);
    assert_eq!(service.write_breaker().state(), CircuitState::Closed);

    service.store.set_down(false);
    // With the read circuit open the cache is skipped outright; history
    // still answers from the durable store.
    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "durable");
}

#[tokio::test]
async fn reads_degrade_to_an_empty_page() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service.store.set_down(true);
    service.db().close().await;

    assert!(service.fetch_history(room, 0, Some(10)).await.is_empty());
}

#[tokio::test]
async fn read_receipts_survive_concurrent_message_arrivals() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    // Seed the cached metadata document.
    service
        .send_message(room, 2, "anyone there?".into(), None)
        .await
        .unwrap();

    service.mark_read(room, 1).await.unwrap();
    let arrival = service
        .send_message(room, 2, "hello?".into(), None)
        .await
        .unwrap();
    service.flush_now().await;

    let meta = service.room_metadata(room).await.unwrap();
    assert_eq!(meta.last_message_preview.as_deref(), Some("hello?"));
    assert_eq!(meta.last_message_at, Some(arrival.created_at));
    assert!(meta.mem1_last_read_at.is_some());
}

#[tokio::test]
async fn read_receipts_write_through_when_the_cache_is_cold() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service.mark_read(room, 1).await.unwrap();

    let meta = service.room_metadata(room).await.unwrap();
    assert!(meta.mem1_last_read_at.is_some());
    assert!(meta.mem2_last_read_at.is_none());

    let err = service.mark_read(room, 99).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn recovery_invalidates_stale_cache_entries() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    // Warm the cached metadata, then write around the cache during an
    // outage so the cached document goes stale.
    service
        .send_message(room, 1, "cached".into(), None)
        .await
        .unwrap();
    service.store.set_down(true);
    service
        .send_message(room, 2, "written around the cache".into(), None)
        .await
        .unwrap();

    service.store.set_down(false);
    service.metadata_breaker().record_success();
    service.write_breaker().record_success();
    service.flush_now().await;

    // The stale document was dropped; the durable store answers with the
    // fallback write's view.
    let meta = service.room_metadata(room).await.unwrap();
    assert_eq!(
        meta.last_message_preview.as_deref(),
        Some("written around the cache")
    );
}

#[tokio::test]
async fn reply_references_resolve_from_history() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    let original = service
        .send_message(room, 1, "original".into(), None)
        .await
        .unwrap();
    service
        .send_message(room, 2, "replying".into(), Some(original.message_id))
        .await
        .unwrap();
    service.flush_now().await;

    let found = service.find_messages(&[original.message_id]).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, "original");

    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history[1].reply_to_id, Some(original.message_id));
}

#[tokio::test]
async fn validation_failures_never_reach_the_queue() {
    let service = setup().await;

    let err = service
        .send_message(0, 1, "no room".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(service.queue_depths().await.iter().sum::<usize>(), 0);
}

#[tokio::test]
async fn flush_loop_starts_and_shuts_down() {
    let service = setup().await;
    let room = service.register_room(1, 2).await.unwrap().chatroom_id;

    service
        .send_message(room, 1, "background".into(), None)
        .await
        .unwrap();

    let handle = service.start_flush_loop();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    handle.shutdown().await;

    let history = service.fetch_history(room, 0, Some(10)).await;
    assert_eq!(history.len(), 1);
}
