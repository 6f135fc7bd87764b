//! Collaborator boundaries of the session core.
//!
//! The coordinator, history manager, and pipeline only talk to the outside
//! world through these traits. `parley-bot` provides the Telegram, OpenAI,
//! and SQLite implementations; the `testing` module provides doubles.

use async_trait::async_trait;

use crate::error::{AccountError, CompletionError, TransportError};
use crate::types::{ChatId, HistoryTurn, InboundEvent, MessageHandle, Role, Tier, UserId, UserProfile};

/// Chat transport used for replies and transient status indicators.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a short notice and return a handle that can delete it later.
    async fn send_notice(&self, chat: ChatId, text: &str) -> Result<MessageHandle, TransportError>;

    /// Deliver a completion reply. Splitting long text is the transport's job.
    async fn send_reply(&self, chat: ChatId, text: &str) -> Result<(), TransportError>;

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError>;

    /// Delete the user's own message that triggered `event`.
    async fn delete_incoming_event(&self, event: &InboundEvent) -> Result<(), TransportError>;
}

/// Answers whether a user may use the bot and under which tier.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn is_subscription_active(&self, user: UserId) -> Result<bool, AccountError>;

    async fn is_in_trial(&self, user: UserId) -> Result<bool, AccountError>;

    /// Internal accounts bypass quota and history bounds.
    async fn is_unlimited(&self, _user: UserId) -> Result<bool, AccountError> {
        Ok(false)
    }
}

/// Derive the user's tier for this event. `None` means access is denied.
pub async fn resolve_tier(gate: &dyn QuotaGate, user: UserId) -> Result<Option<Tier>, AccountError> {
    if gate.is_unlimited(user).await? {
        return Ok(Some(Tier::Unlimited));
    }
    if gate.is_subscription_active(user).await? {
        return Ok(Some(Tier::Subscribed));
    }
    if gate.is_in_trial(user).await? {
        return Ok(Some(Tier::Trial));
    }
    Ok(None)
}

/// Result of one completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub reply: String,
    pub role: Role,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// External completion service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn respond(
        &self,
        history: &[HistoryTurn],
        new_turn: &HistoryTurn,
    ) -> Result<Completion, CompletionError>;
}

/// Persistent account bookkeeping. Nothing here is on the coordination path.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn user_exists(&self, user: UserId) -> Result<bool, AccountError>;

    async fn register_user(&self, profile: &UserProfile) -> Result<(), AccountError>;

    async fn record_exchange_tokens(
        &self,
        user: UserId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), AccountError>;

    async fn increment_request_count(&self, user: UserId) -> Result<(), AccountError>;

    async fn record_error(&self, user: UserId, kind: &str, message: &str) -> Result<(), AccountError>;
}
