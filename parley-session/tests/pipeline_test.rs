//! Integration tests for the request pipeline.
//!
//! These tests verify:
//! - Stage ordering and short-circuiting
//! - Lock release on every exit path
//! - Bookkeeping after successful exchanges only
//! - Command handling under the per-user lock

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use parley_session::notices;
use parley_session::testing::{
    event_for, FaultyStore, MemoryAccounts, RecordingTransport, ScriptedCompletion, StaticQuota,
};
use parley_session::{
    AfterCheck, BlockReason, Command, CompletionError, CoordinatorSettings, FailureKind,
    HistoryManager, HistoryPolicy, HistoryTurn, Outcome, RequestPipeline, SessionCoordinator,
    Tier, UserId,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Setup Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    store: Arc<FaultyStore>,
    transport: Arc<RecordingTransport>,
    completion: Arc<ScriptedCompletion>,
    accounts: Arc<MemoryAccounts>,
    pipeline: Arc<RequestPipeline>,
}

impl Harness {
    fn new(quota: StaticQuota) -> Self {
        Self::new_shared(Arc::new(quota))
    }

    fn new_shared(quota: Arc<StaticQuota>) -> Self {
        let store = Arc::new(FaultyStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let completion = Arc::new(ScriptedCompletion::new());
        let accounts = Arc::new(MemoryAccounts::new());

        let coordinator = Arc::new(SessionCoordinator::new(
            store.clone(),
            transport.clone(),
            CoordinatorSettings::default(),
        ));
        let history = Arc::new(HistoryManager::new(
            store.clone(),
            transport.clone(),
            HistoryPolicy::default(),
            Duration::from_secs(7 * 24 * 60 * 60),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            accounts.clone(),
            quota,
            coordinator,
            history,
            completion.clone(),
            transport.clone(),
        ));

        Self {
            store,
            transport,
            completion,
            accounts,
            pipeline,
        }
    }

    fn with_tier(tier: Tier) -> Self {
        Self::new(StaticQuota::new(Some(tier)))
    }

    async fn in_flight(&self, user: i64) -> bool {
        self.pipeline
            .coordinator()
            .is_in_flight(UserId(user))
            .await
            .unwrap()
    }

    async fn exchanges(&self, user: i64) -> usize {
        self.pipeline
            .history()
            .exchange_count(UserId(user))
            .await
            .unwrap()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_exchange() {
    let h = Harness::with_tier(Tier::Subscribed);

    let outcome = h.pipeline.handle(event_for(1, "hello")).await;
    assert_eq!(
        outcome,
        Outcome::Replied {
            exchange_count: Some(1),
            after: Some(AfterCheck::Ok),
            input_tokens: 10,
            output_tokens: 20,
        }
    );
    assert_eq!(h.transport.replies(), vec!["echo: hello".to_string()]);
    assert!(!h.in_flight(1).await);
    assert_eq!(h.exchanges(1).await, 1);

    let row = h.accounts.row(UserId(1)).unwrap();
    assert_eq!(row.requests, 1);
    assert_eq!(row.input_tokens, 10);
    assert_eq!(row.output_tokens, 20);
}

#[tokio::test]
async fn test_new_user_greeted_once() {
    let h = Harness::with_tier(Tier::Trial);

    h.pipeline.handle(event_for(2, "one")).await;
    h.pipeline.handle(event_for(2, "two")).await;

    let welcomes = h
        .transport
        .notice_texts()
        .into_iter()
        .filter(|t| t == notices::WELCOME)
        .count();
    assert_eq!(welcomes, 1);
}

#[tokio::test]
async fn test_history_passed_to_completion() {
    let h = Harness::with_tier(Tier::Subscribed);

    h.pipeline.handle(event_for(3, "first")).await;
    h.pipeline.handle(event_for(3, "second")).await;

    assert_eq!(h.completion.seen_history(), vec![0, 2]);
    let turns = h.pipeline.history().load(UserId(3)).await.unwrap();
    assert_eq!(turns[2], HistoryTurn::user("second"));
    assert_eq!(turns[3], HistoryTurn::assistant("echo: second"));
}

#[tokio::test]
async fn test_tier_is_resolved_per_event() {
    let quota = Arc::new(StaticQuota::new(Some(Tier::Trial)));
    let h = Harness::new_shared(quota.clone());

    for n in 1..=4 {
        h.pipeline.handle(event_for(6, &format!("q{n}"))).await;
    }
    quota.set_tier(Some(Tier::Subscribed));
    h.completion.push_reply("subscribed answer");

    let outcome = h.pipeline.handle(event_for(6, "q5")).await;
    assert_eq!(
        outcome,
        Outcome::Replied {
            exchange_count: Some(5),
            after: Some(AfterCheck::Ok),
            input_tokens: 10,
            output_tokens: 20,
        }
    );
    assert_eq!(h.exchanges(6).await, 5);
    assert_eq!(
        h.transport.replies().last(),
        Some(&"subscribed answer".to_string())
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Short circuits
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_denied_without_taking_lock() {
    let h = Harness::new(StaticQuota::new(None));

    assert_eq!(h.pipeline.handle(event_for(4, "hi")).await, Outcome::Denied);
    assert_eq!(h.completion.calls(), 0);
    assert!(!h.in_flight(4).await);
    assert!(h
        .transport
        .notice_texts()
        .contains(&notices::SUBSCRIPTION_REQUIRED.to_string()));
}

#[tokio::test]
async fn test_quota_errors_deny() {
    let h = Harness::new(StaticQuota::failing());
    assert_eq!(h.pipeline.handle(event_for(5, "hi")).await, Outcome::Denied);
    assert_eq!(h.completion.calls(), 0);
}

#[tokio::test]
async fn test_blocked_skips_completion_and_releases() {
    let h = Harness::with_tier(Tier::Subscribed);
    for n in 0..50 {
        h.pipeline
            .history()
            .append_exchange(
                UserId(6),
                &HistoryTurn::user(format!("q{n}")),
                &HistoryTurn::assistant(format!("a{n}")),
            )
            .await
            .unwrap();
    }

    let outcome = h.pipeline.handle(event_for(6, "one more")).await;
    assert_eq!(
        outcome,
        Outcome::Blocked(BlockReason {
            exchange_count: 50,
            max_exchanges: 50
        })
    );
    assert_eq!(h.completion.calls(), 0);
    assert!(!h.in_flight(6).await);
    assert_eq!(h.exchanges(6).await, 50);
    assert!(h
        .transport
        .notice_texts()
        .contains(&notices::HISTORY_FULL.to_string()));
}

#[tokio::test]
async fn test_trial_history_reset_through_pipeline() {
    let h = Harness::with_tier(Tier::Trial);

    for n in 1..5 {
        let outcome = h.pipeline.handle(event_for(7, &format!("m{n}"))).await;
        assert!(matches!(outcome, Outcome::Replied { exchange_count: Some(c), .. } if c == n));
    }
    let fifth = h.pipeline.handle(event_for(7, "m5")).await;
    assert!(matches!(
        fifth,
        Outcome::Replied {
            exchange_count: Some(5),
            after: Some(AfterCheck::Reset { max_exchanges: 5 }),
            ..
        }
    ));
    assert_eq!(h.exchanges(7).await, 0);
    assert!(h
        .transport
        .notice_texts()
        .contains(&notices::TRIAL_RESET.to_string()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_downstream_failure_releases_lock_without_append() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.completion.push_error(CompletionError::Api {
        status: 503,
        message: "overloaded".into(),
    });

    let outcome = h.pipeline.handle(event_for(8, "hi")).await;
    assert_eq!(outcome, Outcome::Failed(FailureKind::DownstreamFailure));
    assert!(!h.in_flight(8).await);
    assert_eq!(h.exchanges(8).await, 0);
    assert!(h
        .transport
        .notice_texts()
        .contains(&notices::GENERIC_FAILURE.to_string()));
    assert_eq!(h.accounts.errors(UserId(8)), vec!["downstream_failure"]);
    assert_eq!(h.accounts.row(UserId(8)).unwrap().requests, 0);

    // The user is not stuck.
    let retry = h.pipeline.handle(event_for(8, "hi again")).await;
    assert!(matches!(retry, Outcome::Replied { .. }));
}

#[tokio::test]
async fn test_coordination_unavailable_skips_processing() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.store.set_fail_locks(true);

    let outcome = h.pipeline.handle(event_for(9, "hi")).await;
    assert_eq!(outcome, Outcome::Failed(FailureKind::CoordinationUnavailable));
    assert_eq!(h.completion.calls(), 0);
    assert!(h
        .transport
        .notice_texts()
        .contains(&notices::SERVICE_UNAVAILABLE.to_string()));
    assert_eq!(h.accounts.errors(UserId(9)), vec!["coordination_unavailable"]);
}

#[tokio::test]
async fn test_history_read_failure_fails_closed() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.store.set_fail_history_reads(true);

    let outcome = h.pipeline.handle(event_for(10, "hi")).await;
    assert_eq!(outcome, Outcome::Failed(FailureKind::HistoryUnavailable));
    assert_eq!(h.completion.calls(), 0);
    assert!(!h.in_flight(10).await);
}

#[tokio::test]
async fn test_history_write_failure_still_replies() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.store.set_fail_history_writes(true);

    let outcome = h.pipeline.handle(event_for(11, "hi")).await;
    assert_eq!(
        outcome,
        Outcome::Replied {
            exchange_count: None,
            after: None,
            input_tokens: 10,
            output_tokens: 20,
        }
    );
    assert_eq!(h.transport.replies(), vec!["echo: hi".to_string()]);
    assert!(!h.in_flight(11).await);
    assert_eq!(h.accounts.errors(UserId(11)), vec!["history_unavailable"]);
}

#[tokio::test]
async fn test_bookkeeping_failure_is_not_user_visible() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.accounts.set_fail(true);

    let outcome = h.pipeline.handle(event_for(12, "hi")).await;
    assert!(matches!(outcome, Outcome::Replied { .. }));
    assert_eq!(h.transport.replies(), vec!["echo: hi".to_string()]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_second_event_deferred_while_first_in_flight() {
    let h = Harness::with_tier(Tier::Subscribed);
    let gate = Arc::new(Notify::new());
    h.completion.hold_until(gate.clone());

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.handle(event_for(13, "first")).await });
    while h.completion.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let second = event_for(13, "second");
    assert_eq!(h.pipeline.handle(second.clone()).await, Outcome::Deferred);
    assert_eq!(h.completion.calls(), 1);

    gate.notify_one();
    assert!(matches!(first.await.unwrap(), Outcome::Replied { .. }));
    assert!(!h.in_flight(13).await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(h.transport.deleted_incoming().contains(&second.handle()));
    assert_eq!(h.exchanges(13).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_release_keeps_reply_and_lock_expires() {
    let h = Harness::with_tier(Tier::Subscribed);
    let gate = Arc::new(Notify::new());
    h.completion.hold_until(gate.clone());

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.handle(event_for(18, "hello")).await });
    while h.completion.calls() == 0 {
        tokio::task::yield_now().await;
    }

    h.store.set_fail_locks(true);
    gate.notify_one();
    assert!(matches!(first.await.unwrap(), Outcome::Replied { .. }));
    assert_eq!(h.transport.replies(), vec!["echo: hello".to_string()]);

    h.store.set_fail_locks(false);
    assert!(h.in_flight(18).await);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!h.in_flight(18).await);
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reset_command_clears_history() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.pipeline.handle(event_for(14, "hello")).await;

    let outcome = h.pipeline.handle(event_for(14, "/reset_conversation")).await;
    assert_eq!(outcome, Outcome::Command(Command::Reset));
    assert_eq!(h.exchanges(14).await, 0);
    assert!(!h.in_flight(14).await);
    assert!(h.transport.replies().contains(&notices::RESET_DONE.to_string()));
}

#[tokio::test]
async fn test_show_dialog_renders_history() {
    let h = Harness::with_tier(Tier::Subscribed);
    h.pipeline.handle(event_for(15, "hello")).await;

    let outcome = h.pipeline.handle(event_for(15, "/show_dialog")).await;
    assert_eq!(outcome, Outcome::Command(Command::ShowDialog));
    assert_eq!(
        h.transport.replies().last().unwrap(),
        "user: hello\n\nassistant: echo: hello"
    );
}

#[tokio::test]
async fn test_commands_bypass_quota() {
    let h = Harness::new(StaticQuota::new(None));

    assert_eq!(
        h.pipeline.handle(event_for(16, "/help")).await,
        Outcome::Command(Command::Help)
    );
    assert_eq!(
        h.pipeline.handle(event_for(16, "/show_dialog")).await,
        Outcome::Command(Command::ShowDialog)
    );
    assert!(h.transport.replies().contains(&notices::EMPTY_DIALOG.to_string()));
}

#[tokio::test]
async fn test_reset_deferred_while_request_in_flight() {
    let h = Harness::with_tier(Tier::Subscribed);
    let gate = Arc::new(Notify::new());
    h.completion.hold_until(gate.clone());

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.handle(event_for(17, "first")).await });
    while h.completion.calls() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        h.pipeline.handle(event_for(17, "/reset")).await,
        Outcome::Deferred
    );
    gate.notify_one();
    first.await.unwrap();
    assert_eq!(h.exchanges(17).await, 1);
}
