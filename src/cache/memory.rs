//! In-process cache store.
//!
//! Default backend when no cache URL is configured, and the deterministic
//! substrate for tests. Expiry is lazy: an entry past its deadline is
//! dropped on the next touch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheError, CacheStore};
use crate::chatroom::ChatRoomMetadata;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().expect("memory store lock poisoned");
        f(&mut entries)
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(Entry::expired) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn list<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, CacheError> {
    let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::List(items) => Ok(items),
        _ => Err(CacheError::corrupt(format!("{key} is not a list"))),
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries| match live(entries, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(CacheError::corrupt(format!("{key} is not a string"))),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_owned(),
                Entry {
                    value: Value::Str(value.to_owned()),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.with_entries(|entries| Ok(live(entries, key).is_some()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            if let Some(entry) = live(entries, key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn push_front(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            list(entries, key)?.push_front(value.to_owned());
            Ok(())
        })
    }

    async fn push_back(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            list(entries, key)?.push_back(value.to_owned());
            Ok(())
        })
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries| match live(entries, key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.pop_back()),
            Some(_) => Err(CacheError::corrupt(format!("{key} is not a list"))),
            None => Ok(None),
        })
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<String>, CacheError> {
        self.with_entries(|entries| match live(entries, key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.iter().skip(start).take(count).cloned().collect()),
            Some(_) => Err(CacheError::corrupt(format!("{key} is not a list"))),
            None => Ok(Vec::new()),
        })
    }

    async fn list_trim(&self, key: &str, max_len: usize) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            if let Some(Entry {
                value: Value::List(items),
                ..
            }) = live(entries, key)
            {
                items.truncate(max_len);
            }
        });
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, CacheError> {
        self.with_entries(|entries| match live(entries, key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.len()),
            Some(_) => Err(CacheError::corrupt(format!("{key} is not a list"))),
            None => Ok(0),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), CacheError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(members) => {
                    members.insert(member.to_owned());
                    Ok(())
                }
                _ => Err(CacheError::corrupt(format!("{key} is not a set"))),
            }
        })
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries| match live(entries, key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                let picked = members.iter().next().cloned();
                if let Some(member) = &picked {
                    members.remove(member);
                }
                Ok(picked)
            }
            Some(_) => Err(CacheError::corrupt(format!("{key} is not a set"))),
            None => Ok(None),
        })
    }

    async fn apply_read_status(
        &self,
        key: &str,
        user_id: i64,
        at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.with_entries(|entries| {
            let Some(Entry {
                value: Value::Str(raw),
                expires_at,
            }) = live(entries, key)
            else {
                return Ok(false);
            };

            let mut meta: ChatRoomMetadata =
                serde_json::from_str(raw).map_err(CacheError::corrupt)?;
            let Some(slot) = meta.read_slot_mut(user_id) else {
                return Ok(false);
            };
            if slot.map_or(true, |existing| existing <= at) {
                *slot = Some(at);
            }

            *raw = serde_json::to_string(&meta).map_err(CacheError::corrupt)?;
            *expires_at = Some(Instant::now() + ttl);
            Ok(true)
        })
    }

    async fn apply_message_meta(
        &self,
        key: &str,
        preview: &str,
        at: DateTime<Utc>,
        sender_id: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.with_entries(|entries| {
            let Some(Entry {
                value: Value::Str(raw),
                expires_at,
            }) = live(entries, key)
            else {
                return Ok(false);
            };

            let mut meta: ChatRoomMetadata =
                serde_json::from_str(raw).map_err(CacheError::corrupt)?;
            meta.apply_message(preview, at, sender_id);

            *raw = serde_json::to_string(&meta).map_err(CacheError::corrupt)?;
            *expires_at = Some(Instant::now() + ttl);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_json() -> String {
        serde_json::to_string(&ChatRoomMetadata {
            chatroom_id: 1,
            member1_id: 10,
            member2_id: 20,
            last_message_preview: None,
            last_message_at: None,
            mem1_last_read_at: None,
            mem2_last_read_at: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_keep_both_ends_straight() {
        let store = MemoryStore::new();
        store.push_front("q", "a").await.unwrap();
        store.push_front("q", "b").await.unwrap();
        store.push_front("q", "c").await.unwrap();

        // Consumption end returns the oldest producer push first.
        assert_eq!(store.pop_back("q").await.unwrap().as_deref(), Some("a"));
        store.push_back("q", "a").await.unwrap();
        assert_eq!(store.pop_back("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.list_len("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expired_entries_vanish() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_type_access_is_a_corrupt_payload() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(
            store.pop_back("k").await,
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn read_status_requires_a_present_document() {
        let store = MemoryStore::new();
        let applied = store
            .apply_read_status("meta", 10, Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!applied);

        store.set("meta", &meta_json(), None).await.unwrap();
        let applied = store
            .apply_read_status("meta", 10, Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(applied);

        // Not a member of the room.
        let applied = store
            .apply_read_status("meta", 99, Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn message_meta_and_read_status_do_not_lose_each_other() {
        let store = MemoryStore::new();
        store.set("meta", &meta_json(), None).await.unwrap();
        let t1 = Utc::now();

        store
            .apply_message_meta("meta", "hello", t1, 20, Duration::from_secs(60))
            .await
            .unwrap();
        store
            .apply_read_status("meta", 10, t1, Duration::from_secs(60))
            .await
            .unwrap();

        let meta: ChatRoomMetadata =
            serde_json::from_str(&store.get("meta").await.unwrap().unwrap()).unwrap();
        assert_eq!(meta.last_message_preview.as_deref(), Some("hello"));
        assert_eq!(meta.last_message_at, Some(t1));
        assert_eq!(meta.mem1_last_read_at, Some(t1));
        assert_eq!(meta.mem2_last_read_at, Some(t1));
    }
}
