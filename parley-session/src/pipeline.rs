//! Request pipeline.
//!
//! Every inbound event runs through a fixed chain:
//!
//! ```text
//! NewUserCheck → QuotaGate → admit → checkBeforeProcessing → completion
//!     → append + checkAfterAppend → release
//! ```
//!
//! Any stage that does not allow the event stops the chain. Once `admit`
//! returns a lease, the lease is released on every exit path before the
//! outcome is returned. Store and completion failures are recovered here and
//! never reach the event loop.

use std::sync::Arc;

use crate::command::Command;
use crate::coordinator::{Decision, SessionCoordinator, SessionLease};
use crate::error::SessionError;
use crate::history::{AfterCheck, BeforeCheck, BlockReason, HistoryManager};
use crate::notices;
use crate::traits::{resolve_tier, AccountStore, CompletionService, QuotaGate, Transport};
use crate::types::{ChatId, HistoryTurn, InboundEvent, Tier, UserId};

/// Failure classes recovered at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CoordinationUnavailable,
    HistoryUnavailable,
    DownstreamFailure,
}

impl From<&SessionError> for FailureKind {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::CoordinationUnavailable(_) => FailureKind::CoordinationUnavailable,
            SessionError::HistoryUnavailable(_) => FailureKind::HistoryUnavailable,
            SessionError::DownstreamFailure(_) => FailureKind::DownstreamFailure,
        }
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The completion reply was delivered.
    Replied {
        /// Exchange count after the append; `None` if the append failed.
        exchange_count: Option<usize>,
        after: Option<AfterCheck>,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// A command was handled.
    Command(Command),
    /// The quota gate refused the user.
    Denied,
    /// Another request for the user is in flight.
    Deferred,
    /// The history window is full.
    Blocked(BlockReason),
    /// A recoverable failure stopped processing.
    Failed(FailureKind),
}

/// Statically ordered composition of the request stages.
pub struct RequestPipeline {
    accounts: Arc<dyn AccountStore>,
    quota: Arc<dyn QuotaGate>,
    coordinator: Arc<SessionCoordinator>,
    history: Arc<HistoryManager>,
    completion: Arc<dyn CompletionService>,
    transport: Arc<dyn Transport>,
}

impl RequestPipeline {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        quota: Arc<dyn QuotaGate>,
        coordinator: Arc<SessionCoordinator>,
        history: Arc<HistoryManager>,
        completion: Arc<dyn CompletionService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            accounts,
            quota,
            coordinator,
            history,
            completion,
            transport,
        }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    /// Process one inbound event to completion.
    pub async fn handle(&self, event: InboundEvent) -> Outcome {
        self.ensure_registered(&event).await;

        if let Some(command) = Command::parse(&event.text) {
            return self.handle_command(command, &event).await;
        }

        let Some(tier) = self.resolve_tier(&event).await else {
            self.notify(event.chat_id, notices::SUBSCRIPTION_REQUIRED).await;
            return Outcome::Denied;
        };

        let lease = match self.admit(&event).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Outcome::Deferred,
            Err(kind) => return Outcome::Failed(kind),
        };

        let outcome = self.process(&event, tier).await;
        finish(lease).await;

        if let Outcome::Replied {
            input_tokens,
            output_tokens,
            ..
        } = &outcome
        {
            self.record_usage(event.user_id(), *input_tokens, *output_tokens)
                .await;
        }
        outcome
    }

    /// Stage 1: register unknown users and greet them.
    async fn ensure_registered(&self, event: &InboundEvent) {
        let user = event.user_id();
        match self.accounts.user_exists(user).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.accounts.register_user(&event.user).await {
                    tracing::warn!(user_id = %user, error = %e, "Failed to register user");
                    return;
                }
                tracing::info!(user_id = %user, username = ?event.user.username, "Registered new user");
                self.notify(event.chat_id, notices::WELCOME).await;
            }
            Err(e) => tracing::warn!(user_id = %user, error = %e, "Failed to look up user"),
        }
    }

    /// Stage 2: quota gate. Lookup errors deny.
    async fn resolve_tier(&self, event: &InboundEvent) -> Option<Tier> {
        let user = event.user_id();
        match resolve_tier(self.quota.as_ref(), user).await {
            Ok(Some(tier)) => {
                tracing::debug!(user_id = %user, tier = %tier, "Quota check passed");
                Some(tier)
            }
            Ok(None) => {
                tracing::info!(user_id = %user, "Quota exhausted, denying request");
                None
            }
            Err(e) => {
                tracing::error!(user_id = %user, error = %e, "Quota check failed, denying request");
                None
            }
        }
    }

    /// Stage 3: take the user's lock. `Ok(None)` means deferred.
    async fn admit(&self, event: &InboundEvent) -> Result<Option<SessionLease>, FailureKind> {
        match self.coordinator.admit(event).await {
            Ok(Decision::Proceed(lease)) => Ok(Some(lease)),
            Ok(Decision::Deferred) => Ok(None),
            Err(e) => {
                self.fail(event, &e, notices::SERVICE_UNAVAILABLE).await;
                Err(FailureKind::from(&e))
            }
        }
    }

    /// Stages 4 to 6, run while holding the lease.
    async fn process(&self, event: &InboundEvent, tier: Tier) -> Outcome {
        let user = event.user_id();

        match self.history.check_before_processing(user, tier).await {
            Ok(BeforeCheck::Allow) => {}
            Ok(BeforeCheck::Blocked(reason)) => {
                self.notify(event.chat_id, notices::HISTORY_FULL).await;
                return Outcome::Blocked(reason);
            }
            Err(e) => return self.fail(event, &e, notices::SERVICE_UNAVAILABLE).await,
        }

        let turns = match self.history.load(user).await {
            Ok(turns) => turns,
            Err(e) => return self.fail(event, &e, notices::SERVICE_UNAVAILABLE).await,
        };

        let new_turn = HistoryTurn::user(event.text.clone());
        let completion = match self.completion.respond(&turns, &new_turn).await {
            Ok(completion) => completion,
            Err(e) => {
                let err = SessionError::DownstreamFailure(e);
                return self.fail(event, &err, notices::GENERIC_FAILURE).await;
            }
        };
        tracing::info!(
            user_id = %user,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "Completion received"
        );

        let reply_turn = HistoryTurn {
            role: completion.role,
            content: completion.reply.clone(),
        };
        let exchange_count = match self.history.append_exchange(user, &new_turn, &reply_turn).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::error!(user_id = %user, error = %e, "Failed to append history, replying anyway");
                self.record_error(user, &e).await;
                None
            }
        };

        if let Err(e) = self.transport.send_reply(event.chat_id, &completion.reply).await {
            tracing::warn!(user_id = %user, error = %e, "Failed to deliver reply");
        }

        let after = match exchange_count {
            Some(_) => match self.history.check_after_append(user, event.chat_id, tier).await {
                Ok(check) => Some(check),
                Err(e) => {
                    tracing::error!(user_id = %user, error = %e, "History check after append failed");
                    None
                }
            },
            None => None,
        };

        Outcome::Replied {
            exchange_count,
            after,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        }
    }

    async fn handle_command(&self, command: Command, event: &InboundEvent) -> Outcome {
        let user = event.user_id();
        tracing::debug!(user_id = %user, command = command.as_str(), "Handling command");

        match command {
            Command::Start => {
                self.notify(event.chat_id, notices::WELCOME).await;
                return Outcome::Command(command);
            }
            Command::Help => {
                self.notify(event.chat_id, notices::HELP).await;
                return Outcome::Command(command);
            }
            Command::Reset | Command::ShowDialog => {}
        }

        let lease = match self.admit(event).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Outcome::Deferred,
            Err(kind) => return Outcome::Failed(kind),
        };

        let result = match command {
            Command::Reset => self.history.reset(user).await.map(|()| notices::RESET_DONE.to_string()),
            _ => self
                .history
                .load(user)
                .await
                .map(|turns| notices::render_dialog(&turns)),
        };
        let outcome = match result {
            Ok(text) => {
                if command == Command::Reset {
                    tracing::info!(user_id = %user, "History reset by user");
                }
                if let Err(e) = self.transport.send_reply(event.chat_id, &text).await {
                    tracing::warn!(user_id = %user, error = %e, "Failed to deliver command reply");
                }
                Outcome::Command(command)
            }
            Err(e) => self.fail(event, &e, notices::SERVICE_UNAVAILABLE).await,
        };

        finish(lease).await;
        outcome
    }

    /// Log, record, and notify a recoverable failure.
    async fn fail(&self, event: &InboundEvent, err: &SessionError, notice: &str) -> Outcome {
        let user = event.user_id();
        tracing::error!(user_id = %user, kind = err.kind(), error = %err, "Request failed");
        self.record_error(user, err).await;
        self.notify(event.chat_id, notice).await;
        Outcome::Failed(FailureKind::from(err))
    }

    async fn record_error(&self, user: UserId, err: &SessionError) {
        if let Err(e) = self
            .accounts
            .record_error(user, err.kind(), &err.to_string())
            .await
        {
            tracing::warn!(user_id = %user, error = %e, "Failed to record error");
        }
    }

    /// Bookkeeping after the lock is released. Failures are only logged.
    async fn record_usage(&self, user: UserId, input_tokens: u64, output_tokens: u64) {
        if let Err(e) = self
            .accounts
            .record_exchange_tokens(user, input_tokens, output_tokens)
            .await
        {
            tracing::warn!(user_id = %user, error = %e, "Failed to record token usage");
        }
        if let Err(e) = self.accounts.increment_request_count(user).await {
            tracing::warn!(user_id = %user, error = %e, "Failed to increment request count");
        }
    }

    async fn notify(&self, chat: ChatId, text: &str) {
        if let Err(e) = self.transport.send_notice(chat, text).await {
            tracing::warn!(chat_id = %chat, error = %e, "Failed to send notice");
        }
    }
}
/// Release the lease at the end of a request.
///
/// The lease logs a failed release; the lock then expires on its TTL and
/// the request outcome stands.
async fn finish(lease: SessionLease) {
    if lease.release().await.is_err() {
        tracing::debug!("Lock left to expire");
    }
}

