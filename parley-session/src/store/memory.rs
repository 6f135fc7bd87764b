//! In-memory store backend.
//!
//! Expiry is tracked with `tokio::time::Instant`, so tests running with a
//! paused clock can advance past TTLs deterministically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{HistoryStore, LockStore};
use crate::error::StoreResult;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Single-process store implementing both [`LockStore`] and [`HistoryStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    locks: Mutex<HashMap<String, Entry<String>>>,
    lists: Mutex<HashMap<String, Entry<Vec<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a live history list.
    pub async fn history_ttl(&self, key: &str) -> Option<Duration> {
        let lists = self.lists.lock().await;
        lists
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }
}

fn remove_prefixed<T>(map: &mut HashMap<String, Entry<T>>, prefix: &str) -> u64 {
    let mut removed = 0;
    map.retain(|key, entry| {
        if !entry.is_live() {
            return false;
        }
        if key.starts_with(prefix) {
            removed += 1;
            return false;
        }
        true
    });
    removed
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|e| e.is_live()) {
            return Ok(false);
        }
        locks.insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(true)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let locks = self.locks.lock().await;
        Ok(locks.get(key).is_some_and(|e| e.is_live()))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let locks = self.locks.lock().await;
        Ok(locks
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.locks.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.is_live() && entry.value == value => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut locks = self.locks.lock().await;
        Ok(remove_prefixed(&mut locks, prefix))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, key: &str, items: &[String], ttl: Duration) -> StoreResult<u64> {
        let mut lists = self.lists.lock().await;
        let entry = lists
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Vec::new(), ttl));
        if !entry.is_live() {
            entry.value.clear();
        }
        entry.value.extend(items.iter().cloned());
        entry.expires_at = Instant::now() + ttl;
        Ok(entry.value.len() as u64)
    }

    async fn read_all(&self, key: &str, ttl: Duration) -> StoreResult<Vec<String>> {
        let mut lists = self.lists.lock().await;
        match lists.get_mut(key) {
            Some(entry) if entry.is_live() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(entry.value.clone())
            }
            Some(_) => {
                lists.remove(key);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn len(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut lists = self.lists.lock().await;
        match lists.get_mut(key) {
            Some(entry) if entry.is_live() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(entry.value.len() as u64)
            }
            Some(_) => {
                lists.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lists.lock().await.remove(key);
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut lists = self.lists.lock().await;
        Ok(remove_prefixed(&mut lists, prefix))
    }
}
