//! Conversation history window.
//!
//! History lives in the store as a list of JSON turns under
//! `history:{user_id}`, appended one exchange (user turn + reply) at a time.
//! The window is bounded per tier:
//!
//! - trial: reaching the bound evicts the whole history
//! - subscribed: reaching the bound warns; the next request is blocked until
//!   the user resets
//! - unlimited: no bound
//!
//! Below the bound, a reminder fires when the remaining headroom ratio is at or
//! under `reminder_ratio`, the exchange count is a multiple of
//! `reminder_stride`, and the count is above `max * reminder_floor_ratio`.
//!
//! A dangling unpaired turn (a crash between the two pushes of an older
//! layout, or a manual edit) is left in place and counted with floor division.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{SessionError, StoreError};
use crate::notices;
use crate::store::HistoryStore;
use crate::traits::Transport;
use crate::types::{history_key, ChatId, HistoryTurn, Tier, UserId};
use parley_common::HistoryConfig;

/// Why a request was blocked before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReason {
    pub exchange_count: usize,
    pub max_exchanges: usize,
}

/// Result of the pre-processing check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeCheck {
    Allow,
    Blocked(BlockReason),
}

/// Result of the post-append check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterCheck {
    Ok,
    /// Advisory reminder; history untouched.
    Reminder { remaining: usize },
    /// Subscribed user reached the bound; history untouched.
    LimitReached { max_exchanges: usize },
    /// Trial user reached the bound; history evicted.
    Reset { max_exchanges: usize },
}

/// Tier bounds and reminder predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPolicy {
    pub trial_max: usize,
    pub subscribed_max: usize,
    pub reminder_ratio: f64,
    pub reminder_stride: usize,
    pub reminder_floor_ratio: f64,
}

impl From<&HistoryConfig> for HistoryPolicy {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            trial_max: config.trial_max_exchanges,
            subscribed_max: config.subscribed_max_exchanges,
            reminder_ratio: config.reminder_ratio,
            reminder_stride: config.reminder_stride,
            reminder_floor_ratio: config.reminder_floor_ratio,
        }
    }
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self::from(&HistoryConfig::default())
    }
}

impl HistoryPolicy {
    /// Exchange bound for a tier; `None` means unbounded.
    pub fn max_history(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Trial => Some(self.trial_max),
            Tier::Subscribed => Some(self.subscribed_max),
            Tier::Unlimited => None,
        }
    }

    pub fn before(&self, exchange_count: usize, tier: Tier) -> BeforeCheck {
        match self.max_history(tier) {
            Some(max) if exchange_count >= max => BeforeCheck::Blocked(BlockReason {
                exchange_count,
                max_exchanges: max,
            }),
            _ => BeforeCheck::Allow,
        }
    }

    /// Decide what follows an append. Eviction itself is done by the manager.
    pub fn after(&self, exchange_count: usize, tier: Tier) -> AfterCheck {
        let Some(max) = self.max_history(tier) else {
            return AfterCheck::Ok;
        };
        if exchange_count >= max {
            return match tier {
                Tier::Trial => AfterCheck::Reset { max_exchanges: max },
                _ => AfterCheck::LimitReached { max_exchanges: max },
            };
        }
        if self.should_remind(exchange_count, max) {
            return AfterCheck::Reminder {
                remaining: max - exchange_count,
            };
        }
        AfterCheck::Ok
    }

    fn should_remind(&self, exchange_count: usize, max: usize) -> bool {
        if max == 0 || exchange_count >= max || self.reminder_stride == 0 {
            return false;
        }
        let remaining_ratio = (max - exchange_count) as f64 / max as f64;
        let floor = max as f64 * self.reminder_floor_ratio;
        remaining_ratio <= self.reminder_ratio + 1e-9
            && exchange_count % self.reminder_stride == 0
            && exchange_count as f64 > floor
    }
}

/// Enforces the history window against the history store.
pub struct HistoryManager {
    store: Arc<dyn HistoryStore>,
    transport: Arc<dyn Transport>,
    policy: HistoryPolicy,
    ttl: Duration,
}

impl HistoryManager {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        transport: Arc<dyn Transport>,
        policy: HistoryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            ttl,
        }
    }

    pub fn policy(&self) -> &HistoryPolicy {
        &self.policy
    }

    /// Number of complete exchanges stored for the user.
    pub async fn exchange_count(&self, user: UserId) -> Result<usize, SessionError> {
        let len = self
            .store
            .len(&history_key(user), self.ttl)
            .await
            .map_err(SessionError::HistoryUnavailable)? as usize;
        if len % 2 == 1 {
            tracing::warn!(user_id = %user, turns = len, "History has a dangling unpaired turn");
        }
        Ok(len / 2)
    }

    /// Block processing when the window is already full.
    pub async fn check_before_processing(
        &self,
        user: UserId,
        tier: Tier,
    ) -> Result<BeforeCheck, SessionError> {
        let count = self.exchange_count(user).await?;
        let check = self.policy.before(count, tier);
        if let BeforeCheck::Blocked(reason) = check {
            tracing::info!(
                user_id = %user,
                tier = %tier,
                exchange_count = reason.exchange_count,
                max_exchanges = reason.max_exchanges,
                "History full, blocking request"
            );
        }
        Ok(check)
    }

    /// Read the whole history. Undecodable entries are skipped.
    pub async fn load(&self, user: UserId) -> Result<Vec<HistoryTurn>, SessionError> {
        let raw = self
            .store
            .read_all(&history_key(user), self.ttl)
            .await
            .map_err(SessionError::HistoryUnavailable)?;
        if raw.len() % 2 == 1 {
            tracing::warn!(user_id = %user, turns = raw.len(), "History has a dangling unpaired turn");
        }
        let turns = raw
            .iter()
            .filter_map(|item| match serde_json::from_str::<HistoryTurn>(item) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    tracing::warn!(user_id = %user, error = %e, "Skipping undecodable history entry");
                    None
                }
            })
            .collect();
        Ok(turns)
    }

    /// Append one exchange atomically, returning the new exchange count.
    pub async fn append_exchange(
        &self,
        user: UserId,
        user_turn: &HistoryTurn,
        reply: &HistoryTurn,
    ) -> Result<usize, SessionError> {
        let items = [user_turn, reply]
            .iter()
            .map(|t| serde_json::to_string(t).map_err(StoreError::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(SessionError::HistoryUnavailable)?;
        let len = self
            .store
            .append(&history_key(user), &items, self.ttl)
            .await
            .map_err(SessionError::HistoryUnavailable)?;
        Ok(len as usize / 2)
    }

    /// Re-evaluate the window after an append, evicting or notifying.
    pub async fn check_after_append(
        &self,
        user: UserId,
        chat: ChatId,
        tier: Tier,
    ) -> Result<AfterCheck, SessionError> {
        let count = self.exchange_count(user).await?;
        let check = self.policy.after(count, tier);
        match check {
            AfterCheck::Ok => {}
            AfterCheck::Reminder { remaining } => {
                self.notify(chat, &notices::reminder(remaining)).await;
            }
            AfterCheck::LimitReached { max_exchanges } => {
                tracing::info!(user_id = %user, max_exchanges, "Subscribed history limit reached");
                self.notify(chat, notices::LIMIT_REACHED).await;
            }
            AfterCheck::Reset { max_exchanges } => {
                self.reset(user).await?;
                tracing::info!(user_id = %user, max_exchanges, "Trial history evicted");
                self.notify(chat, notices::TRIAL_RESET).await;
            }
        }
        Ok(check)
    }

    /// Delete the user's whole history.
    pub async fn reset(&self, user: UserId) -> Result<(), SessionError> {
        self.store
            .delete(&history_key(user))
            .await
            .map_err(SessionError::HistoryUnavailable)
    }

    async fn notify(&self, chat: ChatId, text: &str) {
        if let Err(e) = self.transport.send_notice(chat, text).await {
            tracing::warn!(chat_id = %chat, error = %e, "Failed to send history notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: usize, ratio: f64, stride: usize, floor: f64) -> HistoryPolicy {
        HistoryPolicy {
            trial_max: max,
            subscribed_max: max,
            reminder_ratio: ratio,
            reminder_stride: stride,
            reminder_floor_ratio: floor,
        }
    }

    #[test]
    fn test_max_history_per_tier() {
        let policy = HistoryPolicy::default();
        assert_eq!(policy.max_history(Tier::Trial), Some(5));
        assert_eq!(policy.max_history(Tier::Subscribed), Some(50));
        assert_eq!(policy.max_history(Tier::Unlimited), None);
    }

    #[test]
    fn test_before_blocks_at_bound() {
        let policy = HistoryPolicy::default();
        assert_eq!(policy.before(4, Tier::Trial), BeforeCheck::Allow);
        assert_eq!(
            policy.before(5, Tier::Trial),
            BeforeCheck::Blocked(BlockReason {
                exchange_count: 5,
                max_exchanges: 5
            })
        );
        assert_eq!(policy.before(5, Tier::Subscribed), BeforeCheck::Allow);
        assert_eq!(policy.before(10_000, Tier::Unlimited), BeforeCheck::Allow);
    }

    #[test]
    fn test_after_at_bound_depends_on_tier() {
        let policy = HistoryPolicy::default();
        assert_eq!(
            policy.after(5, Tier::Trial),
            AfterCheck::Reset { max_exchanges: 5 }
        );
        assert_eq!(
            policy.after(50, Tier::Subscribed),
            AfterCheck::LimitReached { max_exchanges: 50 }
        );
    }

    #[test]
    fn test_reminder_with_stride_five_never_fires_below_bound_of_ten() {
        let policy = policy(10, 0.4, 5, 0.1);
        for count in 1..10 {
            assert_eq!(policy.after(count, Tier::Subscribed), AfterCheck::Ok, "count {count}");
        }
    }

    #[test]
    fn test_reminder_follows_ratio_and_stride() {
        let policy = policy(10, 0.4, 2, 0.1);
        let fired: Vec<usize> = (1..10)
            .filter(|&c| matches!(policy.after(c, Tier::Subscribed), AfterCheck::Reminder { .. }))
            .collect();
        assert_eq!(fired, vec![6, 8]);
        assert_eq!(
            policy.after(6, Tier::Subscribed),
            AfterCheck::Reminder { remaining: 4 }
        );
    }

    #[test]
    fn test_reminder_respects_floor() {
        let policy = policy(10, 1.0, 1, 0.5);
        let fired: Vec<usize> = (1..10)
            .filter(|&c| matches!(policy.after(c, Tier::Trial), AfterCheck::Reminder { .. }))
            .collect();
        assert_eq!(fired, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_default_subscribed_reminders() {
        let policy = HistoryPolicy::default();
        let fired: Vec<usize> = (1..50)
            .filter(|&c| matches!(policy.after(c, Tier::Subscribed), AfterCheck::Reminder { .. }))
            .collect();
        assert_eq!(fired, vec![30, 35, 40, 45]);
    }

    #[test]
    fn test_unlimited_never_reminds() {
        let policy = HistoryPolicy::default();
        assert_eq!(policy.after(1_000, Tier::Unlimited), AfterCheck::Ok);
    }
}
