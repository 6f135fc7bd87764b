//! Session coordinator: at most one in-flight request per user.
//!
//! `admit` atomically creates `processing:{user_id}` with a TTL. The winner
//! gets a [`SessionLease`] and must release it when processing ends; every
//! other event for that user is deferred. Each lock value carries a token
//! unique to its lease, and a lease only deletes the lock while it still
//! holds that token, so a lease that outlived its TTL cannot free a newer
//! holder's lock.
//!
//! Transient status indicators are retired by detached watchers that poll
//! the lock until the lease they belong to is gone, either because the key
//! was deleted or because it now holds another lease's token. Retirement
//! depends only on store state and works across instances.
//!
//! If a lease is never released the TTL clears the lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{SessionError, StoreResult};
use crate::notices;
use crate::store::LockStore;
use crate::traits::Transport;
use crate::types::{lock_key, InboundEvent, LockRecord, MessageHandle, UserId};
use parley_common::SessionConfig;

/// Timing parameters of the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub lock_ttl: Duration,
    pub poll_interval: Duration,
    /// A watcher stops polling after this long even if the lock is still present.
    pub watcher_max_wait: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for CoordinatorSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            poll_interval: config.poll_interval(),
            watcher_max_wait: config.watcher_max_wait(),
        }
    }
}

/// Outcome of [`SessionCoordinator::admit`].
#[derive(Debug)]
pub enum Decision {
    /// The event holds the user's lock until the lease is released.
    Proceed(SessionLease),
    /// Another request for this user is in flight; drop this event.
    Deferred,
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed(_))
    }
}

/// Proof of holding a user's lock.
///
/// Call [`SessionLease::release`] on every exit path. Dropping an unreleased
/// lease spawns the release in the background; if no runtime is available
/// the lock is left to expire.
pub struct SessionLease {
    user_id: UserId,
    key: String,
    value: String,
    locks: Arc<dyn LockStore>,
    released: bool,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("user_id", &self.user_id)
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl SessionLease {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Delete the lock if this lease still holds it.
    ///
    /// Returns `false` when the TTL already cleared the lock, or another
    /// lease has taken it since; that lock is left untouched.
    pub async fn release(mut self) -> StoreResult<bool> {
        self.released = true;
        let result = self.locks.delete_if_value(&self.key, &self.value).await;
        match &result {
            Ok(true) => tracing::debug!(user_id = %self.user_id, "Lock released"),
            Ok(false) => tracing::warn!(
                user_id = %self.user_id,
                "Lease outlived its lock, nothing to release"
            ),
            Err(e) => tracing::error!(
                user_id = %self.user_id,
                error = %e,
                "Failed to release lock, waiting for TTL"
            ),
        }
        result
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = Arc::clone(&self.locks);
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);
        let user_id = self.user_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(user_id = %user_id, "Lease dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = locks.delete_if_value(&key, &value).await {
                        tracing::error!(user_id = %user_id, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "No runtime to release lock, waiting for TTL");
            }
        }
    }
}

/// Something a watcher deletes once the lock clears.
#[derive(Debug, Clone)]
enum Retire {
    Notice(MessageHandle),
    Incoming(InboundEvent),
}

/// Owns per-user locks and the watchers retiring status indicators.
pub struct SessionCoordinator {
    locks: Arc<dyn LockStore>,
    transport: Arc<dyn Transport>,
    settings: CoordinatorSettings,
    /// Identifies this process in lock values.
    instance_id: String,
    watchers: Mutex<JoinSet<()>>,
}

impl SessionCoordinator {
    pub fn new(
        locks: Arc<dyn LockStore>,
        transport: Arc<dyn Transport>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            locks,
            transport,
            settings,
            instance_id: uuid::Uuid::new_v4().to_string(),
            watchers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Try to take the user's lock for `event`.
    ///
    /// Fails closed with [`SessionError::CoordinationUnavailable`] when the
    /// lock store cannot answer.
    pub async fn admit(&self, event: &InboundEvent) -> Result<Decision, SessionError> {
        let user_id = event.user_id();
        let key = lock_key(user_id);
        let record = LockRecord::new(user_id, self.settings.lock_ttl, &self.instance_id);
        let value = serde_json::to_string(&record)
            .map_err(|e| SessionError::CoordinationUnavailable(e.into()))?;

        let acquired = self
            .locks
            .try_acquire(&key, &value, self.settings.lock_ttl)
            .await
            .map_err(SessionError::CoordinationUnavailable)?;

        if acquired {
            tracing::debug!(user_id = %user_id, ttl_secs = record.ttl_secs, "Lock acquired");
            let lease = SessionLease {
                user_id,
                key: key.clone(),
                value: value.clone(),
                locks: Arc::clone(&self.locks),
                released: false,
            };
            match self.transport.send_notice(event.chat_id, notices::PROCESSING).await {
                Ok(handle) => {
                    self.spawn_watcher(user_id, key, Some(value), vec![Retire::Notice(handle)])
                        .await
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to send processing indicator")
                }
            }
            return Ok(Decision::Proceed(lease));
        }

        tracing::debug!(user_id = %user_id, message_id = event.message_id, "Request in flight, deferring event");
        // The current holder's value; without it the watcher waits for the key to go.
        let holder = match self.locks.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "Could not read lock holder");
                None
            }
        };
        let mut retire = Vec::with_capacity(2);
        match self.transport.send_notice(event.chat_id, notices::PLEASE_WAIT).await {
            Ok(handle) => retire.push(Retire::Notice(handle)),
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Failed to send wait indicator"),
        }
        retire.push(Retire::Incoming(event.clone()));
        self.spawn_watcher(user_id, key, holder, retire).await;
        Ok(Decision::Deferred)
    }

    /// Delete the user's lock whoever holds it. Idempotent.
    pub async fn release(&self, user_id: UserId) -> Result<(), SessionError> {
        self.locks
            .delete(&lock_key(user_id))
            .await
            .map_err(SessionError::CoordinationUnavailable)
    }

    /// Whether the user currently has a request in flight.
    pub async fn is_in_flight(&self, user_id: UserId) -> Result<bool, SessionError> {
        self.locks
            .exists(&lock_key(user_id))
            .await
            .map_err(SessionError::CoordinationUnavailable)
    }

    /// Number of watchers still polling.
    pub async fn active_watchers(&self) -> usize {
        let mut watchers = self.watchers.lock().await;
        while watchers.try_join_next().is_some() {}
        watchers.len()
    }

    /// Abort all outstanding watchers without waiting for them.
    ///
    /// Returns how many were aborted. Their indicators stay on screen.
    pub async fn shutdown(&self) -> usize {
        let mut watchers = self.watchers.lock().await;
        while watchers.try_join_next().is_some() {}
        let pending = watchers.len();
        watchers.abort_all();
        watchers.detach_all();
        tracing::info!(aborted = pending, "Session coordinator stopped");
        pending
    }

    async fn spawn_watcher(
        &self,
        user_id: UserId,
        key: String,
        holder: Option<String>,
        retire: Vec<Retire>,
    ) {
        let locks = Arc::clone(&self.locks);
        let transport = Arc::clone(&self.transport);
        let settings = self.settings;

        let mut watchers = self.watchers.lock().await;
        while watchers.try_join_next().is_some() {}
        watchers.spawn(async move {
            wait_for_release(locks.as_ref(), &key, holder.as_deref(), user_id, &settings).await;
            for item in retire {
                let result = match &item {
                    Retire::Notice(handle) => transport.delete_message(handle).await,
                    Retire::Incoming(event) => transport.delete_incoming_event(event).await,
                };
                if let Err(e) = result {
                    tracing::debug!(user_id = %user_id, error = %e, "Failed to retire indicator");
                }
            }
        });
    }
}

/// Poll until `holder` no longer owns `key` or the watcher cap is hit.
///
/// With no known holder, waits for the key to be deleted.
async fn wait_for_release(
    locks: &dyn LockStore,
    key: &str,
    holder: Option<&str>,
    user_id: UserId,
    settings: &CoordinatorSettings,
) {
    let started = Instant::now();
    loop {
        match locks.get(key).await {
            Ok(None) => return,
            Ok(Some(current)) if holder.is_some_and(|h| h != current) => return,
            Ok(Some(_)) => {}
            Err(e) => tracing::debug!(user_id = %user_id, error = %e, "Lock check failed, retrying"),
        }
        if started.elapsed() >= settings.watcher_max_wait {
            tracing::warn!(
                user_id = %user_id,
                waited_secs = started.elapsed().as_secs(),
                "Watcher gave up waiting for lock release"
            );
            return;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{event_for, RecordingTransport};

    fn coordinator() -> (Arc<MemoryStore>, Arc<RecordingTransport>, SessionCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let coordinator =
            SessionCoordinator::new(store.clone(), transport.clone(), CoordinatorSettings::default());
        (store, transport, coordinator)
    }

    #[tokio::test]
    async fn test_lock_value_records_holder() {
        let (store, _transport, coordinator) = coordinator();
        let decision = coordinator.admit(&event_for(7, "hi")).await.unwrap();
        assert!(decision.is_proceed());

        let value = store.get("processing:7").await.unwrap().unwrap();
        let record: LockRecord = serde_json::from_str(&value).unwrap();
        assert_eq!(record.user_id, UserId(7));
        assert_eq!(record.ttl_secs, 60);
        assert_eq!(record.holder, coordinator.instance_id());
        assert!(!record.token.is_empty());

        if let Decision::Proceed(lease) = decision {
            assert!(lease.release().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_in_background() {
        let (_store, _transport, coordinator) = coordinator();
        let decision = coordinator.admit(&event_for(3, "hi")).await.unwrap();
        drop(decision);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!coordinator.is_in_flight(UserId(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_processing_indicator_sent() {
        let (_store, transport, coordinator) = coordinator();
        let _decision = coordinator.admit(&event_for(5, "hi")).await.unwrap();
        assert_eq!(transport.notice_texts(), vec![notices::PROCESSING.to_string()]);
    }
}
