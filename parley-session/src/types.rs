//! Core identifiers and records shared by the coordinator, history, and pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable user identifier (Telegram user id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat a notice or reply is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a message the bot sent, used to delete it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// Author of a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation, stored as JSON in the history list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

impl HistoryTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Quota class of a user, derived per event from the quota gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Trial,
    Subscribed,
    /// Internal accounts without a history bound.
    Unlimited,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Subscribed => "subscribed",
            Tier::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender profile carried by every inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    pub username: Option<String>,
    pub language_code: Option<String>,
}

impl UserProfile {
    pub fn new(id: i64, first_name: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            first_name: first_name.into(),
            username: None,
            language_code: None,
        }
    }
}

/// A user message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub trace_id: String,
    pub user: UserProfile,
    pub chat_id: ChatId,
    pub message_id: i64,
    pub text: String,
}

impl InboundEvent {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    /// Handle of the user's own message, for deleting it.
    pub fn handle(&self) -> MessageHandle {
        MessageHandle {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }
}

/// Value stored under `processing:{user_id}` while a request is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user_id: UserId,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Instance id of the bot process holding the lock.
    pub holder: String,
    /// Unique per lease; only the lease that wrote it may delete the lock.
    pub token: String,
}

impl LockRecord {
    pub fn new(user_id: UserId, ttl: Duration, holder: impl Into<String>) -> Self {
        Self {
            user_id,
            acquired_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            holder: holder.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Lock store key for a user.
pub fn lock_key(user_id: UserId) -> String {
    format!("processing:{}", user_id)
}

/// History store key for a user.
pub fn history_key(user_id: UserId) -> String {
    format!("history:{}", user_id)
}

/// Key prefix shared by all locks.
pub const LOCK_PREFIX: &str = "processing:";

/// Key prefix shared by all histories.
pub const HISTORY_PREFIX: &str = "history:";
