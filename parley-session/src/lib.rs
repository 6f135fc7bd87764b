//! Parley Session - per-user request coordination for a conversational bot.
//!
//! This crate provides:
//! - Lock and history store abstractions with in-memory and Redis backends
//! - The session coordinator (one in-flight request per user, TTL crash safety)
//! - The history manager (tier-dependent window, reminders, eviction)
//! - The request pipeline composing quota, coordination, history, and completion
//! - Collaborator traits for transport, quota, completion, and accounts

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod command;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod notices;
pub mod pipeline;
pub mod store;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::Command;
pub use coordinator::{CoordinatorSettings, Decision, SessionCoordinator, SessionLease};
pub use error::{
    AccountError, CompletionError, SessionError, StoreError, StoreResult, TransportError,
};
pub use history::{AfterCheck, BeforeCheck, BlockReason, HistoryManager, HistoryPolicy};
pub use pipeline::{FailureKind, Outcome, RequestPipeline};
pub use store::{create_store, HistoryStore, LockStore, SessionStore, StoreBackend};
pub use traits::{resolve_tier, AccountStore, Completion, CompletionService, QuotaGate, Transport};
pub use types::{
    ChatId, HistoryTurn, InboundEvent, LockRecord, MessageHandle, Role, Tier, UserId, UserProfile,
};
