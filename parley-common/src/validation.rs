//! Configuration validation for the Parley bot.
//!
//! Provides validation logic for configuration fields to ensure
//! all required values are present and within valid ranges.

use thiserror::Error;

use crate::config::{
    Config, HistoryConfig, LlmConfig, ObservabilityConfig, RedisConfig, SessionConfig,
    TelegramConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else if errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ValidationError::Multiple(errors))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Config {
    /// Validate every section that does not depend on credentials.
    pub fn validate(&self) -> ValidationResult<()> {
        let results = [
            self.redis.validate(),
            self.session.validate(),
            self.history.validate(),
            self.observability.validate(),
        ];
        collect(results.into_iter().filter_map(Result::err).collect())
    }

    /// Validate the configuration needed to run the bot, credentials included.
    pub fn validate_for_serve(&self) -> ValidationResult<()> {
        let results = [
            self.validate(),
            self.telegram.validate(),
            self.llm.validate(),
        ];
        collect(results.into_iter().filter_map(Result::err).collect())
    }
}

impl Validate for TelegramConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.bot_token.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "telegram.bot_token".into(),
            });
        }
        if url::Url::parse(&self.api_base).is_err() {
            errors.push(invalid("telegram.api_base", "not a valid URL"));
        }
        collect(errors)
    }
}

impl Validate for LlmConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.api_key.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "llm.api_key".into(),
            });
        }
        if self.model.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "llm.model".into(),
            });
        }
        if url::Url::parse(&self.base_url).is_err() {
            errors.push(invalid("llm.base_url", "not a valid URL"));
        }
        collect(errors)
    }
}

impl Validate for RedisConfig {
    fn validate(&self) -> ValidationResult<()> {
        match url::Url::parse(&self.url) {
            Ok(url) if matches!(url.scheme(), "redis" | "rediss") => Ok(()),
            Ok(url) => Err(invalid(
                "redis.url",
                format!("unsupported scheme '{}'", url.scheme()),
            )),
            Err(e) => Err(invalid("redis.url", e.to_string())),
        }
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.lock_ttl_secs == 0 {
            errors.push(invalid("session.lock_ttl_secs", "must be greater than 0"));
        }
        if self.poll_interval_ms == 0 {
            errors.push(invalid("session.poll_interval_ms", "must be greater than 0"));
        } else if self.poll_interval() >= self.lock_ttl() && self.lock_ttl_secs > 0 {
            errors.push(ValidationError::Conflict {
                reason: "session.poll_interval_ms must be shorter than session.lock_ttl_secs"
                    .into(),
            });
        }
        if self.watcher_max_wait_secs < self.lock_ttl_secs {
            errors.push(ValidationError::Conflict {
                reason: "session.watcher_max_wait_secs must be at least session.lock_ttl_secs"
                    .into(),
            });
        }
        collect(errors)
    }
}

impl Validate for HistoryConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if self.trial_max_exchanges == 0 {
            errors.push(invalid("history.trial_max_exchanges", "must be greater than 0"));
        }
        if self.subscribed_max_exchanges < self.trial_max_exchanges {
            errors.push(ValidationError::Conflict {
                reason: format!(
                    "history.subscribed_max_exchanges ({}) is below history.trial_max_exchanges ({})",
                    self.subscribed_max_exchanges, self.trial_max_exchanges
                ),
            });
        }
        if !(self.reminder_ratio > 0.0 && self.reminder_ratio <= 1.0) {
            errors.push(invalid("history.reminder_ratio", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.reminder_floor_ratio) {
            errors.push(invalid("history.reminder_floor_ratio", "must be in [0, 1)"));
        }
        if self.reminder_stride == 0 {
            errors.push(invalid("history.reminder_stride", "must be greater than 0"));
        }
        if self.ttl_days == 0 {
            errors.push(invalid("history.ttl_days", "must be greater than 0"));
        }
        collect(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(invalid(
                "observability.log_level",
                format!("unknown level '{}'", self.log_level),
            ));
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            errors.push(invalid(
                "observability.log_format",
                "must be 'pretty' or 'json'",
            ));
        }
        collect(errors)
    }
}
