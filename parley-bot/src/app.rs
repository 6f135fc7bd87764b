//! Serve loop: wires the stores, pipeline, and Telegram poller together.

use anyhow::{Context, Result};
use parley_common::Config;
use parley_session::{
    create_store, Command, CoordinatorSettings, HistoryManager, HistoryPolicy, RequestPipeline,
    SessionCoordinator, SessionStore, StoreBackend,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::accounts::SqliteAccountStore;
use crate::completion::OpenAiCompletion;
use crate::telegram::TelegramTransport;

/// Inbound events buffered between the poller and the dispatcher.
const EVENT_BUFFER: usize = 256;

/// How long in-flight handlers may run after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A fully wired bot process.
pub struct App {
    pipeline: Arc<RequestPipeline>,
    telegram: Arc<TelegramTransport>,
}

impl App {
    pub fn new(pipeline: Arc<RequestPipeline>, telegram: Arc<TelegramTransport>) -> Self {
        Self { pipeline, telegram }
    }

    /// Build every collaborator from config.
    ///
    /// Fails if Redis is unreachable, the database cannot be opened, or the
    /// bot token is rejected.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = create_store(StoreBackend::Redis, &config.redis)
            .await
            .context("Failed to connect to Redis")?;
        tracing::info!(url = %config.redis.url, "Session store connected");

        let accounts = Arc::new(
            SqliteAccountStore::open(&config.database.path, config.quota.clone())
                .context("Failed to open account database")?,
        );

        let telegram = Arc::new(TelegramTransport::new(&config.telegram));
        telegram
            .verify()
            .await
            .context("Telegram rejected the bot token")?;
        telegram
            .drop_pending_updates()
            .await
            .context("Failed to drop pending Telegram updates")?;

        let completion =
            Arc::new(OpenAiCompletion::new(&config.llm).context("Failed to build LLM client")?);
        tracing::info!(model = completion.model(), "Completion client ready");

        let pipeline = build_pipeline(config, store, accounts, completion, telegram.clone());
        Ok(Self::new(Arc::new(pipeline), telegram))
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    /// Dispatch events until `shutdown` resolves or the poller stops.
    ///
    /// Each event runs on its own task. On shutdown the poller is stopped,
    /// watchers are aborted, and in-flight handlers get a short grace period.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let telegram = self.telegram.clone();
        let poller = tokio::spawn(async move { telegram.listen(tx).await });

        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("Telegram poller stopped");
                        break;
                    };
                    let kind = if Command::parse(&event.text).is_some() { "command" } else { "message" };
                    let span = parley_common::event_span!(event.trace_id, event.user_id(), kind);
                    let pipeline = self.pipeline.clone();
                    handlers.spawn(
                        async move {
                            let outcome = pipeline.handle(event).await;
                            tracing::info!(outcome = ?outcome, "Event handled");
                        }
                        .instrument(span),
                    );
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Event handler panicked");
                    }
                }
            }
        }

        poller.abort();
        let aborted = self.pipeline.coordinator().shutdown().await;

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = handlers.len(), "Aborting in-flight handlers");
            handlers.abort_all();
        }

        tracing::info!(watchers_aborted = aborted, "Shutdown complete");
        Ok(())
    }
}

/// Compose the request pipeline from its collaborators.
pub fn build_pipeline(
    config: &Config,
    store: SessionStore,
    accounts: Arc<SqliteAccountStore>,
    completion: Arc<OpenAiCompletion>,
    telegram: Arc<TelegramTransport>,
) -> RequestPipeline {
    let coordinator = Arc::new(SessionCoordinator::new(
        store.locks,
        telegram.clone(),
        CoordinatorSettings::from(&config.session),
    ));
    let history = Arc::new(HistoryManager::new(
        store.history,
        telegram.clone(),
        HistoryPolicy::from(&config.history),
        config.history.ttl(),
    ));

    RequestPipeline::new(
        accounts.clone(),
        accounts,
        coordinator,
        history,
        completion,
        telegram,
    )
}
