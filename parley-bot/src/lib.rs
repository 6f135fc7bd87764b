//! Parley Bot - Telegram front end for OpenAI-compatible chat completions.
//!
//! This crate provides the concrete collaborators for `parley-session`:
//! - Telegram Bot API transport and long-poll listener
//! - OpenAI chat completion client
//! - SQLite account store and quota gate
//! - The serve loop that wires them together

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod accounts;
pub mod app;
pub mod completion;
pub mod telegram;

pub use accounts::SqliteAccountStore;
pub use app::App;
pub use completion::OpenAiCompletion;
pub use telegram::TelegramTransport;
