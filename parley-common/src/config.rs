//! Configuration management for the Parley bot.
//!
//! The bot reads a single configuration file at `~/.parley/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `TELEGRAM_BOT_TOKEN` → telegram.bot_token
//! - `OPENAI_API_KEY` → llm.api_key
//! - `OPENAI_BASE_URL` → llm.base_url
//! - `REDIS_URL` → redis.url
//! - `PARLEY_DATABASE_PATH` → database.path
//! - `PARLEY_LOG_LEVEL` → observability.log_level
//! - `PARLEY_LOG_FORMAT` → observability.log_format
//! - `PARLEY_TRIAL_REQUESTS` → quota.trial_requests

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ResultExt};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".parley"),
        |dirs| dirs.home_dir().join(".parley"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Telegram
// ============================================================================

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather.
    #[serde(default)]
    pub bot_token: String,

    /// Telegram user ids or usernames allowed to talk to the bot. `*` allows everyone.
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,

    /// Long-poll timeout for `getUpdates`.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Bot API base URL. Overridden in tests.
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            allowed_users: default_allowed_users(),
            poll_timeout_secs: default_poll_timeout(),
            api_base: default_telegram_api_base(),
        }
    }
}

// ============================================================================
// LLM
// ============================================================================

/// Completion service settings (OpenAI-compatible API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Redis connection settings for the lock and history stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection timeout in seconds.
    #[serde(default = "default_redis_timeout")]
    pub timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            timeout_secs: default_redis_timeout(),
        }
    }
}

/// SQLite account database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

// ============================================================================
// Session coordination
// ============================================================================

/// Per-user in-flight lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lock TTL. Bounds how long a crashed request can block its user.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// How often a deferred-event watcher checks whether the lock cleared.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound on how long a watcher keeps polling.
    #[serde(default = "default_watcher_max_wait")]
    pub watcher_max_wait_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            poll_interval_ms: default_poll_interval(),
            watcher_max_wait_secs: default_watcher_max_wait(),
        }
    }
}

impl SessionConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watcher_max_wait(&self) -> Duration {
        Duration::from_secs(self.watcher_max_wait_secs)
    }
}

// ============================================================================
// History window
// ============================================================================

/// Conversation history bounds and reminder policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum exchanges kept for trial users. Reaching it evicts the history.
    #[serde(default = "default_trial_max")]
    pub trial_max_exchanges: usize,

    /// Maximum exchanges kept for subscribers. Reaching it only warns.
    #[serde(default = "default_subscribed_max")]
    pub subscribed_max_exchanges: usize,

    /// Rolling inactivity expiry of a stored history.
    #[serde(default = "default_history_ttl_days")]
    pub ttl_days: u64,

    /// Remind once `remaining / max` drops to this ratio or below.
    #[serde(default = "default_reminder_ratio")]
    pub reminder_ratio: f64,

    /// Reminders fire only on exchange counts divisible by this stride.
    #[serde(default = "default_reminder_stride")]
    pub reminder_stride: usize,

    /// Reminders fire only above `max * reminder_floor_ratio` exchanges.
    #[serde(default = "default_reminder_floor")]
    pub reminder_floor_ratio: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            trial_max_exchanges: default_trial_max(),
            subscribed_max_exchanges: default_subscribed_max(),
            ttl_days: default_history_ttl_days(),
            reminder_ratio: default_reminder_ratio(),
            reminder_stride: default_reminder_stride(),
            reminder_floor_ratio: default_reminder_floor(),
        }
    }
}

impl HistoryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

// ============================================================================
// Quota
// ============================================================================

/// Trial and subscription quota settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Number of requests a new user may make before a subscription is required.
    #[serde(default = "default_trial_requests")]
    pub trial_requests: u64,

    /// Default subscription length granted by `parley grant`.
    #[serde(default = "default_subscription_months")]
    pub subscription_months: u32,

    /// Internal accounts with no quota and no history bound.
    #[serde(default)]
    pub unlimited_users: Vec<i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            trial_requests: default_trial_requests(),
            subscription_months: default_subscription_months(),
            unlimited_users: Vec::new(),
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Extra targets capped at `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    ///
    /// `path` replaces the default location when given.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(path) = lookup("PARLEY_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("PARLEY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Some(n) = lookup("PARLEY_TRIAL_REQUESTS") {
            match n.parse() {
                Ok(n) => self.quota.trial_requests = n,
                Err(_) => tracing::warn!(value = %n, "Ignoring invalid PARLEY_TRIAL_REQUESTS"),
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_timeout() -> u64 {
    300
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_redis_timeout() -> u64 {
    5
}
fn default_database_path() -> PathBuf {
    config_dir().join("parley.db")
}
fn default_lock_ttl() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    100
}
fn default_watcher_max_wait() -> u64 {
    120
}
fn default_trial_max() -> usize {
    5
}
fn default_subscribed_max() -> usize {
    50
}
fn default_history_ttl_days() -> u64 {
    7
}
fn default_reminder_ratio() -> f64 {
    0.4
}
fn default_reminder_stride() -> usize {
    5
}
fn default_reminder_floor() -> f64 {
    0.1
}
fn default_trial_requests() -> u64 {
    50
}
fn default_subscription_months() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
