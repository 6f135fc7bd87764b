//! Lock and history store abstractions.
//!
//! Both stores live outside the process so that coordination holds across
//! restarts and across several bot instances. The only primitive that
//! guarantees mutual exclusion is [`LockStore::try_acquire`]; callers never
//! check-then-set.
//!
//! # Backends
//!
//! - [`MemoryStore`]: single process, used in tests and local runs
//! - `RedisStore`: shared, requires the `redis-backend` feature

mod memory;
#[cfg(feature = "redis-backend")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;
use parley_common::RedisConfig;

/// Key-value store holding per-user in-flight locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` to `value` with `ttl` if it does not exist.
    ///
    /// Returns `true` when this call created the key.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Current value of `key`, if it is set.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically delete `key` only while it still holds `value`.
    ///
    /// Returns `true` when this call removed the key.
    async fn delete_if_value(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Delete every key starting with `prefix`, returning how many were removed.
    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Ordered list store holding per-user conversation history.
///
/// Every call that touches a list refreshes its TTL.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append all `items` in one atomic step, returning the new length.
    async fn append(&self, key: &str, items: &[String], ttl: Duration) -> StoreResult<u64>;

    async fn read_all(&self, key: &str, ttl: Duration) -> StoreResult<Vec<String>>;

    async fn len(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64>;
}

/// Session store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-memory store (single process).
    #[default]
    Memory,
    /// Redis (shared across instances).
    Redis,
}

/// Lock and history stores used by one bot process.
#[derive(Clone)]
pub struct SessionStore {
    pub locks: Arc<dyn LockStore>,
    pub history: Arc<dyn HistoryStore>,
}

impl SessionStore {
    /// Build a session store where one backend serves both roles.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: LockStore + HistoryStore + 'static,
    {
        Self {
            locks: store.clone(),
            history: store,
        }
    }
}

/// Create the session store for the given backend.
///
/// The Redis backend connects and pings before returning.
#[allow(unused_variables)]
pub async fn create_store(
    backend: StoreBackend,
    redis_config: &RedisConfig,
) -> StoreResult<SessionStore> {
    match backend {
        StoreBackend::Memory => Ok(SessionStore::shared(Arc::new(MemoryStore::new()))),
        StoreBackend::Redis => {
            #[cfg(feature = "redis-backend")]
            {
                let store = RedisStore::connect(redis_config).await?;
                Ok(SessionStore::shared(Arc::new(store)))
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                Err(crate::error::StoreError::Unavailable(
                    "compiled without the redis-backend feature".into(),
                ))
            }
        }
    }
}
