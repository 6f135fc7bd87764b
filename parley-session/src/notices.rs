//! User-facing notice texts.

use crate::types::HistoryTurn;

/// Shown while a request is being processed.
pub const PROCESSING: &str = ". . . . . .";

/// Shown when a message arrives while the previous one is still in flight.
pub const PLEASE_WAIT: &str = "Please wait, I'm still answering your previous message.";

pub const WELCOME: &str =
    "Hi! Send me a message and I'll answer. Use /reset_conversation to start over.";

pub const HELP: &str = "/reset_conversation - clear the conversation\n\
/show_dialog - show the current conversation\n\
/help - show this message";

pub const SUBSCRIPTION_REQUIRED: &str =
    "Your trial has ended. Subscribe to keep chatting.";

pub const SERVICE_UNAVAILABLE: &str =
    "The service is temporarily unavailable. Please try again in a minute.";

pub const GENERIC_FAILURE: &str = "Something went wrong while answering. Please try again.";

/// Sent instead of processing when the history window is full.
pub const HISTORY_FULL: &str =
    "This conversation is too long. Use /reset_conversation to start a new one.";

pub const LIMIT_REACHED: &str = "This conversation reached its length limit. \
Use /reset_conversation before sending the next message.";

pub const TRIAL_RESET: &str = "Trial conversations are limited in length, so this one was cleared. \
Subscribe for longer conversations.";

pub const RESET_DONE: &str = "Conversation cleared.";

pub const EMPTY_DIALOG: &str = "The conversation is empty.";

pub fn reminder(remaining: usize) -> String {
    format!(
        "{} message(s) left in this conversation. Use /reset_conversation to start over.",
        remaining
    )
}

/// Render a history as `role: content` lines.
pub fn render_dialog(turns: &[HistoryTurn]) -> String {
    if turns.is_empty() {
        return EMPTY_DIALOG.to_string();
    }
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
