//! Parley - main entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parley_bot::{App, SqliteAccountStore};
use parley_common::logging::init_logging;
use parley_common::Config;
use parley_session::types::LOCK_PREFIX;
use parley_session::{create_store, StoreBackend, UserId};
use std::path::PathBuf;

/// Parley - Telegram front end for OpenAI chat completions.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "Telegram bot that proxies conversations to an OpenAI-compatible API.", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.parley/config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bot (default)
    Serve,

    /// Load and validate the configuration, then print a summary
    CheckConfig,

    /// Delete every in-flight lock. Only safe while no instance is running.
    ClearLocks,

    /// Extend a user's subscription
    Grant {
        /// Telegram user id
        user_id: i64,

        /// Months to add (defaults to quota.subscription_months)
        #[arg(long)]
        months: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_deref()).context("Failed to load config")?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::CheckConfig => check_config(&config),
        Commands::ClearLocks => clear_locks(&config).await,
        Commands::Grant { user_id, months } => grant(&config, user_id, months),
    }
}

async fn serve(config: Config) -> Result<()> {
    config
        .validate_for_serve()
        .context("Invalid configuration")?;

    tracing::info!("Parley v{}", env!("CARGO_PKG_VERSION"));

    let app = App::connect(&config).await?;
    app.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
}

fn check_config(config: &Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    if let Err(e) = config.validate_for_serve() {
        println!("warning: not ready to serve: {e}");
    }

    println!("telegram.allowed_users   {:?}", config.telegram.allowed_users);
    println!("llm.base_url             {}", config.llm.base_url);
    println!("llm.model                {}", config.llm.model);
    println!("redis.url                {}", config.redis.url);
    println!("database.path            {}", config.database.path.display());
    println!("session.lock_ttl_secs    {}", config.session.lock_ttl_secs);
    println!(
        "history.max_exchanges    trial={} subscribed={}",
        config.history.trial_max_exchanges, config.history.subscribed_max_exchanges
    );
    println!("history.ttl_days         {}", config.history.ttl_days);
    println!("quota.trial_requests     {}", config.quota.trial_requests);
    println!("Configuration OK");
    Ok(())
}

async fn clear_locks(config: &Config) -> Result<()> {
    let store = create_store(StoreBackend::Redis, &config.redis)
        .await
        .context("Failed to connect to Redis")?;
    let removed = store
        .locks
        .clear_prefix(LOCK_PREFIX)
        .await
        .context("Failed to clear locks")?;

    tracing::info!(removed, "Cleared in-flight locks");
    println!("Removed {removed} lock(s)");
    Ok(())
}

fn grant(config: &Config, user_id: i64, months: Option<u32>) -> Result<()> {
    let months = months.unwrap_or(config.quota.subscription_months);
    let accounts = SqliteAccountStore::open(&config.database.path, config.quota.clone())
        .context("Failed to open account database")?;
    let expires = accounts
        .extend_subscription(UserId(user_id), months)
        .with_context(|| format!("Failed to extend subscription for {user_id}"))?;

    println!("User {user_id} subscribed until {}", expires.to_rfc3339());
    Ok(())
}
