//! Redis store backend.
//!
//! Locks map to `SET key value NX PX ttl`. Histories are Redis lists; every
//! list command is pipelined with `PEXPIRE` so reads and writes both refresh
//! the rolling expiry.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{HistoryStore, LockStore};
use crate::error::{StoreError, StoreResult};
use parley_common::RedisConfig;

/// Keys deleted per `DEL` during prefix cleanup.
const DELETE_BATCH: usize = 500;

/// Delete KEYS[1] only if its value equals ARGV[1].
const DELETE_IF_VALUE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                StoreError::Connection(format!("timed out connecting to {}", config.url))
            })?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { conn };
        LockStore::ping(&store).await?;
        tracing::info!(url = %config.url, "Connected to Redis");
        Ok(store)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        ttl.as_millis().max(1) as u64
    }

    async fn scan_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(&pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete_prefixed(&self, prefix: &str) -> StoreResult<u64> {
        let keys = self.scan_keys(prefix).await?;
        let mut conn = self.conn.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_BATCH) {
            let mut cmd = redis::cmd("DEL");
            for key in chunk {
                cmd.arg(key);
            }
            let n: u64 = cmd.query_async(&mut conn).await?;
            removed += n;
        }
        Ok(removed)
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(DELETE_IF_VALUE)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.delete_prefixed(prefix).await
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {pong}")))
        }
    }
}

#[async_trait]
impl HistoryStore for RedisStore {
    async fn append(&self, key: &str, items: &[String], ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let mut rpush = redis::cmd("RPUSH");
        rpush.arg(key);
        for item in items {
            rpush.arg(item);
        }
        let mut pexpire = redis::cmd("PEXPIRE");
        pexpire.arg(key).arg(Self::ttl_millis(ttl));

        let mut pipe = redis::pipe();
        pipe.atomic().add_command(rpush).add_command(pexpire).ignore();
        let (len,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(len)
    }

    async fn read_all(&self, key: &str, ttl: Duration) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn len(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let (len,): (u64,) = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.delete_prefixed(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            timeout_secs: 1,
        }
    }

    async fn redis_store() -> Option<RedisStore> {
        match RedisStore::connect(&test_config()).await {
            Ok(store) => Some(store),
            Err(_) => {
                eprintln!("Skipping Redis test: Redis not available");
                None
            }
        }
    }

    fn unique_key(prefix: &str) -> String {
        format!("{}test-{}", prefix, uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_redis_lock_is_exclusive() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("processing:");
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire(&key, "a", ttl).await.unwrap());
        assert!(!store.try_acquire(&key, "b", ttl).await.unwrap());
        assert!(store.exists(&key).await.unwrap());

        LockStore::delete(&store, &key).await.unwrap();
        LockStore::delete(&store, &key).await.unwrap();
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_redis_conditional_delete() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("processing:");
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire(&key, "b", ttl).await.unwrap());
        assert!(!store.delete_if_value(&key, "a").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("b"));

        assert!(store.delete_if_value(&key, "b").await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redis_lock_expires() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("processing:");

        assert!(store
            .try_acquire(&key, "a", Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_redis_history_roundtrip() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("history:");
        let ttl = Duration::from_secs(30);
        let pair = vec![
            r#"{"role":"user","content":"hi"}"#.to_string(),
            r#"{"role":"assistant","content":"hello"}"#.to_string(),
        ];

        assert_eq!(store.append(&key, &pair, ttl).await.unwrap(), 2);
        assert_eq!(store.len(&key, ttl).await.unwrap(), 2);
        assert_eq!(store.read_all(&key, ttl).await.unwrap(), pair);

        HistoryStore::delete(&store, &key).await.unwrap();
        assert_eq!(store.len(&key, ttl).await.unwrap(), 0);
    }
}
