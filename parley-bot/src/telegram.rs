//! Telegram transport.
//!
//! Long-polls the Bot API for private text messages and implements
//! [`Transport`] for replies and transient status indicators.

use async_trait::async_trait;
use parley_common::logging::generate_trace_id;
use parley_common::TelegramConfig;
use parley_session::{
    ChatId, InboundEvent, MessageHandle, Transport, TransportError, UserId, UserProfile,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Telegram rejects messages longer than this.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Telegram Transport
// ============================================================================

/// Telegram Bot API client.
pub struct TelegramTransport {
    bot_token: String,
    api_base: String,
    allowed_users: Vec<String>,
    poll_timeout_secs: u64,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Self {
        // The long poll must finish before the client gives up on it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            allowed_users: config.allowed_users.clone(),
            poll_timeout_secs: config.poll_timeout_secs,
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    fn is_user_allowed(&self, identity: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == identity)
    }

    fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    /// Call a Bot API method and return its `result`.
    ///
    /// `fail` builds the error for API-level failures other than rate limits.
    async fn call(
        &self,
        method: &str,
        body: &Value,
        fail: fn(String) -> TransportError,
    ) -> Result<Value, TransportError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| fail(format!("{method}: unreadable response ({status}): {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }

        if let Some(retry_after) = data
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
        {
            return Err(TransportError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(fail(format!("{method} ({status}): {description}")))
    }

    /// Verify the bot token and return the bot's username.
    pub async fn verify(&self) -> Result<String, TransportError> {
        let me = self
            .call("getMe", &serde_json::json!({}), TransportError::Connection)
            .await?;
        let username = me
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::info!(bot = %username, "Telegram transport initialized");
        Ok(username)
    }

    /// Discard updates queued while the bot was offline, so a restart does
    /// not replay the backlog.
    pub async fn drop_pending_updates(&self) -> Result<(), TransportError> {
        let body = serde_json::json!({ "drop_pending_updates": true });
        self.call("deleteWebhook", &body, TransportError::Connection)
            .await?;
        tracing::info!("Dropped pending Telegram updates");
        Ok(())
    }

    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageHandle, TransportError> {
        let body = serde_json::json!({
            "chat_id": chat.0,
            "text": text,
        });
        let sent = self
            .call("sendMessage", &body, TransportError::SendFailed)
            .await?;
        let message_id = sent
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| TransportError::SendFailed("sendMessage: missing message_id".into()))?;

        Ok(MessageHandle {
            chat_id: chat,
            message_id,
        })
    }

    /// Fetch one batch of updates starting at `offset`.
    ///
    /// Returns the next offset and the events that passed filtering.
    pub async fn poll_once(&self, offset: i64) -> Result<(i64, Vec<InboundEvent>), TransportError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });
        let result = self
            .call("getUpdates", &body, TransportError::Connection)
            .await?;

        let mut next_offset = offset;
        let mut events = Vec::new();
        for update in result.as_array().into_iter().flatten() {
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                next_offset = next_offset.max(uid + 1);
            }
            if let Some(event) = self.parse_update(update) {
                events.push(event);
            }
        }
        Ok((next_offset, events))
    }

    /// Poll until `tx` is closed, forwarding every accepted event.
    pub async fn listen(&self, tx: mpsc::Sender<InboundEvent>) {
        let mut offset: i64 = 0;

        tracing::info!("Telegram transport listening for messages...");

        while !tx.is_closed() {
            match self.poll_once(offset).await {
                Ok((next, events)) => {
                    offset = next;
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(TransportError::RateLimited { retry_after_secs }) => {
                    tracing::warn!(retry_after_secs, "Telegram poll rate limited");
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram poll error");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Turn one update into an event. Only private text messages from
    /// allowed users are accepted.
    fn parse_update(&self, update: &Value) -> Option<InboundEvent> {
        let message = update.get("message")?;

        let chat = message.get("chat")?;
        if chat.get("type").and_then(Value::as_str) != Some("private") {
            return None;
        }
        let chat_id = chat.get("id").and_then(Value::as_i64)?;

        let from = message.get("from")?;
        let user_id = from.get("id").and_then(Value::as_i64)?;
        let username = from.get("username").and_then(Value::as_str);

        let user_id_str = user_id.to_string();
        let mut identities = vec![user_id_str.as_str()];
        if let Some(name) = username {
            identities.push(name);
        }
        if !self.is_any_user_allowed(identities) {
            tracing::warn!(
                user_id,
                username = username.unwrap_or("unknown"),
                "Ignoring message from unauthorized user"
            );
            return None;
        }

        let text = message.get("text").and_then(Value::as_str)?;
        let message_id = message.get("message_id").and_then(Value::as_i64)?;

        let event = InboundEvent {
            trace_id: generate_trace_id(),
            user: UserProfile {
                id: UserId(user_id),
                first_name: from
                    .get("first_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                username: username.map(str::to_string),
                language_code: from
                    .get("language_code")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            chat_id: ChatId(chat_id),
            message_id,
            text: text.to_string(),
        };

        tracing::debug!(
            trace_id = %event.trace_id,
            user_id,
            chat_id,
            message_id,
            "Telegram message received"
        );
        Some(event)
    }
}

/// Split `message` into chunks of at most `max_len` characters, preferring
/// paragraph, line, sentence, and word boundaries in that order.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_len) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_pos = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(". ").map(|i| i + 1))
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_pos].to_string());
        remaining = remaining[split_pos..].trim_start();
    }

    chunks
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_notice(&self, chat: ChatId, text: &str) -> Result<MessageHandle, TransportError> {
        self.send_text(chat, text).await
    }

    async fn send_reply(&self, chat: ChatId, text: &str) -> Result<(), TransportError> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.send_text(chat, &chunk).await?;
        }
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": handle.chat_id.0,
            "message_id": handle.message_id,
        });
        match self
            .call("deleteMessage", &body, TransportError::DeleteFailed)
            .await
        {
            Ok(_) => Ok(()),
            Err(TransportError::DeleteFailed(reason)) if reason.contains("not found") => {
                tracing::debug!(
                    chat_id = %handle.chat_id,
                    message_id = handle.message_id,
                    "Message already deleted"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_incoming_event(&self, event: &InboundEvent) -> Result<(), TransportError> {
        self.delete_message(&event.handle()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(allowed: &[&str]) -> TelegramTransport {
        TelegramTransport::new(&TelegramConfig {
            bot_token: "123:ABC".into(),
            allowed_users: allowed.iter().map(|s| s.to_string()).collect(),
            ..TelegramConfig::default()
        })
    }

    fn private_update(user_id: i64, username: &str, text: &str) -> Value {
        serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 77,
                "from": { "id": user_id, "first_name": "Ada", "username": username, "language_code": "en" },
                "chat": { "id": user_id, "type": "private" },
                "text": text
            }
        })
    }

    #[test]
    fn test_api_url() {
        let t = transport(&["*"]);
        assert_eq!(
            t.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn test_user_allowed_wildcard() {
        let t = transport(&["*"]);
        assert!(t.is_user_allowed("anyone"));
    }

    #[test]
    fn test_user_allowed_by_id_or_name() {
        let t = transport(&["42", "ada"]);
        assert!(t.is_any_user_allowed(["42"]));
        assert!(t.is_any_user_allowed(["7", "ada"]));
        assert!(!t.is_any_user_allowed(["7", "bob"]));
    }

    #[test]
    fn test_parse_private_text_update() {
        let t = transport(&["*"]);
        let event = t.parse_update(&private_update(42, "ada", "hello")).unwrap();
        assert_eq!(event.user_id(), UserId(42));
        assert_eq!(event.chat_id, ChatId(42));
        assert_eq!(event.message_id, 77);
        assert_eq!(event.text, "hello");
        assert_eq!(event.user.username.as_deref(), Some("ada"));
        assert_eq!(event.user.language_code.as_deref(), Some("en"));
        assert!(!event.trace_id.is_empty());
    }

    #[test]
    fn test_parse_rejects_group_chat() {
        let t = transport(&["*"]);
        let mut update = private_update(42, "ada", "hello");
        update["message"]["chat"]["type"] = "group".into();
        assert!(t.parse_update(&update).is_none());
    }

    #[test]
    fn test_parse_rejects_non_text() {
        let t = transport(&["*"]);
        let mut update = private_update(42, "ada", "hello");
        update["message"].as_object_mut().unwrap().remove("text");
        assert!(t.parse_update(&update).is_none());
    }

    #[test]
    fn test_parse_rejects_unauthorized_user() {
        let t = transport(&["1"]);
        assert!(t.parse_update(&private_update(42, "ada", "hello")).is_none());
    }

    #[test]
    fn test_split_message_short() {
        let result = split_message("Hello, World!", MAX_MESSAGE_LEN);
        assert_eq!(result, vec!["Hello, World!".to_string()]);
    }

    #[test]
    fn test_split_message_long() {
        let msg = "x".repeat(5000);
        let result = split_message(&msg, MAX_MESSAGE_LEN);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].len(), 4096);
        assert_eq!(result[1].len(), 904);
    }

    #[test]
    fn test_split_message_prefers_paragraphs() {
        let msg = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let result = split_message(&msg, 40);
        assert_eq!(result, vec!["a".repeat(30), "b".repeat(30)]);
    }

    #[test]
    fn test_split_message_keeps_sentence_end() {
        let result = split_message("One two. Three four five", 12);
        assert_eq!(result[0], "One two.");
    }

    #[test]
    fn test_split_message_multibyte() {
        let msg = "ж".repeat(10);
        let result = split_message(&msg, 4);
        assert_eq!(result, vec!["жжжж", "жжжж", "жж"]);
    }
}
