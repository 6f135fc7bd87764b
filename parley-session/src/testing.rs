//! Deterministic doubles for the collaborator traits and the stores.
//!
//! Enabled in this crate's tests and for dependents through the `testing`
//! feature.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{AccountError, CompletionError, StoreError, StoreResult, TransportError};
use crate::store::{HistoryStore, LockStore, MemoryStore};
use crate::traits::{AccountStore, Completion, CompletionService, QuotaGate, Transport};
use crate::types::{
    ChatId, HistoryTurn, InboundEvent, MessageHandle, Role, Tier, UserId, UserProfile,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a private-chat event from `user` with the given text.
pub fn event_for(user: i64, text: &str) -> InboundEvent {
    static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(1_000);
    InboundEvent {
        trace_id: parley_common::logging::generate_trace_id(),
        user: UserProfile::new(user, format!("user{user}")),
        chat_id: ChatId(user),
        message_id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst),
        text: text.to_string(),
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A message the recording transport was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub handle: MessageHandle,
    pub text: String,
    pub is_notice: bool,
}

/// Transport that records every call.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    next_id: AtomicI64,
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<MessageHandle>>,
    deleted_incoming: Mutex<Vec<MessageHandle>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail until switched back.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        locked(&self.sent).clone()
    }

    pub fn notice_texts(&self) -> Vec<String> {
        locked(&self.sent)
            .iter()
            .filter(|m| m.is_notice)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn replies(&self) -> Vec<String> {
        locked(&self.sent)
            .iter()
            .filter(|m| !m.is_notice)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageHandle> {
        locked(&self.deleted).clone()
    }

    pub fn deleted_incoming(&self) -> Vec<MessageHandle> {
        locked(&self.deleted_incoming).clone()
    }

    fn record(&self, chat: ChatId, text: &str, is_notice: bool) -> Result<MessageHandle, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("transport offline".into()));
        }
        let handle = MessageHandle {
            chat_id: chat,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        locked(&self.sent).push(SentMessage {
            handle,
            text: text.to_string(),
            is_notice,
        });
        Ok(handle)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_notice(&self, chat: ChatId, text: &str) -> Result<MessageHandle, TransportError> {
        self.record(chat, text, true)
    }

    async fn send_reply(&self, chat: ChatId, text: &str) -> Result<(), TransportError> {
        self.record(chat, text, false).map(|_| ())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        locked(&self.deleted).push(*handle);
        Ok(())
    }

    async fn delete_incoming_event(&self, event: &InboundEvent) -> Result<(), TransportError> {
        locked(&self.deleted_incoming).push(event.handle());
        Ok(())
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Completion service returning queued results, or an echo when the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    queue: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    calls: AtomicUsize,
    seen_history: Mutex<Vec<usize>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: &str) {
        locked(&self.queue).push_back(Ok(Completion {
            reply: reply.to_string(),
            role: Role::Assistant,
            input_tokens: 10,
            output_tokens: 20,
        }));
    }

    pub fn push_error(&self, error: CompletionError) {
        locked(&self.queue).push_back(Err(error));
    }

    /// Block every call until `gate` is notified.
    pub fn hold_until(&self, gate: Arc<Notify>) {
        *locked(&self.gate) = Some(gate);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// History length passed to each call, in call order.
    pub fn seen_history(&self) -> Vec<usize> {
        locked(&self.seen_history).clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn respond(
        &self,
        history: &[HistoryTurn],
        new_turn: &HistoryTurn,
    ) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.seen_history).push(history.len());

        let gate = locked(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripted = locked(&self.queue).pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Completion {
                reply: format!("echo: {}", new_turn.content),
                role: Role::Assistant,
                input_tokens: 10,
                output_tokens: 20,
            })
        })
    }
}

// ============================================================================
// Quota
// ============================================================================

/// Quota gate reporting the same tier for every user.
#[derive(Debug)]
pub struct StaticQuota {
    tier: Mutex<Option<Tier>>,
    fail: bool,
}

impl StaticQuota {
    pub fn new(tier: Option<Tier>) -> Self {
        Self {
            tier: Mutex::new(tier),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            tier: Mutex::new(None),
            fail: true,
        }
    }

    pub fn set_tier(&self, tier: Option<Tier>) {
        *locked(&self.tier) = tier;
    }

    fn check(&self, wanted: Tier) -> Result<bool, AccountError> {
        if self.fail {
            return Err(AccountError::Database("quota lookup failed".into()));
        }
        Ok(*locked(&self.tier) == Some(wanted))
    }
}

#[async_trait]
impl QuotaGate for StaticQuota {
    async fn is_subscription_active(&self, _user: UserId) -> Result<bool, AccountError> {
        self.check(Tier::Subscribed)
    }

    async fn is_in_trial(&self, _user: UserId) -> Result<bool, AccountError> {
        self.check(Tier::Trial)
    }

    async fn is_unlimited(&self, _user: UserId) -> Result<bool, AccountError> {
        self.check(Tier::Unlimited)
    }
}

// ============================================================================
// Accounts
// ============================================================================

/// Account counters kept by [`MemoryAccounts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountRow {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// In-memory account store.
#[derive(Debug, Default)]
pub struct MemoryAccounts {
    users: Mutex<HashMap<UserId, AccountRow>>,
    errors: Mutex<Vec<(UserId, String)>>,
    fail: AtomicBool,
}

impl MemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn row(&self, user: UserId) -> Option<AccountRow> {
        locked(&self.users).get(&user).cloned()
    }

    /// Recorded error kinds for a user.
    pub fn errors(&self, user: UserId) -> Vec<String> {
        locked(&self.errors)
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, kind)| kind.clone())
            .collect()
    }

    fn guard(&self) -> Result<(), AccountError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(AccountError::Database("account store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccounts {
    async fn user_exists(&self, user: UserId) -> Result<bool, AccountError> {
        self.guard()?;
        Ok(locked(&self.users).contains_key(&user))
    }

    async fn register_user(&self, profile: &UserProfile) -> Result<(), AccountError> {
        self.guard()?;
        locked(&self.users).entry(profile.id).or_default();
        Ok(())
    }

    async fn record_exchange_tokens(
        &self,
        user: UserId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), AccountError> {
        self.guard()?;
        let mut users = locked(&self.users);
        let row = users.entry(user).or_default();
        row.input_tokens += input_tokens;
        row.output_tokens += output_tokens;
        Ok(())
    }

    async fn increment_request_count(&self, user: UserId) -> Result<(), AccountError> {
        self.guard()?;
        locked(&self.users).entry(user).or_default().requests += 1;
        Ok(())
    }

    async fn record_error(&self, user: UserId, kind: &str, _message: &str) -> Result<(), AccountError> {
        self.guard()?;
        locked(&self.errors).push((user, kind.to_string()));
        Ok(())
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Memory store whose lock and history operations can be made to fail.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_locks: AtomicBool,
    fail_history_reads: AtomicBool,
    fail_history_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_locks(&self, fail: bool) {
        self.fail_locks.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_history_reads(&self, fail: bool) {
        self.fail_history_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LockStore for FaultyStore {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        Self::check(&self.fail_locks)?;
        self.inner.try_acquire(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Self::check(&self.fail_locks)?;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Self::check(&self.fail_locks)?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::check(&self.fail_locks)?;
        LockStore::delete(&self.inner, key).await
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> StoreResult<bool> {
        Self::check(&self.fail_locks)?;
        self.inner.delete_if_value(key, value).await
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        Self::check(&self.fail_locks)?;
        LockStore::clear_prefix(&self.inner, prefix).await
    }

    async fn ping(&self) -> StoreResult<()> {
        Self::check(&self.fail_locks)
    }
}

#[async_trait]
impl HistoryStore for FaultyStore {
    async fn append(&self, key: &str, items: &[String], ttl: Duration) -> StoreResult<u64> {
        Self::check(&self.fail_history_writes)?;
        self.inner.append(key, items, ttl).await
    }

    async fn read_all(&self, key: &str, ttl: Duration) -> StoreResult<Vec<String>> {
        Self::check(&self.fail_history_reads)?;
        self.inner.read_all(key, ttl).await
    }

    async fn len(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        Self::check(&self.fail_history_reads)?;
        self.inner.len(key, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::check(&self.fail_history_writes)?;
        HistoryStore::delete(&self.inner, key).await
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        Self::check(&self.fail_history_writes)?;
        HistoryStore::clear_prefix(&self.inner, prefix).await
    }
}
