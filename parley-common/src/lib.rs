//! Parley Common - Shared configuration, errors, and logging for the Parley bot.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup and trace id helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    Config, DatabaseConfig, HistoryConfig, LlmConfig, ObservabilityConfig, QuotaConfig,
    RedisConfig, SessionConfig, TelegramConfig,
};
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::{generate_trace_id, init_logging};
    pub use crate::validation::{Validate, ValidationError};
}
