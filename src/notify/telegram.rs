//! Telegram notification channel via the Bot API.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::host::TelegramConfig;
use crate::daemon::state::TelegramMessageRef;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
}

impl TelegramClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn emoji_for(notify_type: &str) -> &'static str {
        match notify_type {
            "Stalled" => "\u{23f8}\u{fe0f}",
            "Done" => "\u{2705}",
            "Waiting" => "\u{2753}",
            _ => "\u{1f4e2}",
        }
    }

    /// Post a message; returns the (chat_id, message_id) pair needed to
    /// delete it on auto-dismiss.
    pub async fn send(
        &self,
        config: &TelegramConfig,
        message: &str,
        notify_type: &str,
        project: &str,
        session: &str,
    ) -> Option<TelegramMessageRef> {
        if config.bot_token.is_empty() || config.chat_id.is_empty() {
            warn!("Telegram bot_token or chat_id not configured");
            return None;
        }

        let emoji = Self::emoji_for(notify_type);
        let text = format!("{emoji} *{project}* | {session}\n\n{message}");
        let url = format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token);

        let response = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "chat_id": config.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!("Telegram API error: {}", response.status());
                return None;
            }
            Err(e) => {
                warn!("Telegram notification failed: {e}");
                return None;
            }
        };

        let body: serde_json::Value = response.json().await.ok()?;
        let result = body.get("result")?;
        Some(TelegramMessageRef {
            chat_id: result
                .pointer("/chat/id")
                .map(|id| id.to_string())
                .unwrap_or_else(|| config.chat_id.clone()),
            message_id: result.get("message_id")?.as_i64()?,
        })
    }

    /// Delete a previously posted message.
    pub async fn delete(&self, config: &TelegramConfig, message: &TelegramMessageRef) -> bool {
        if config.bot_token.is_empty() {
            return false;
        }

        let url = format!(
            "https://api.telegram.org/bot{}/deleteMessage",
            config.bot_token
        );

        let response = self
            .http
            .post(&url)
            .timeout(DELETE_TIMEOUT)
            .json(&json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
            }))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!("Deleted Telegram message {}", message.message_id);
                true
            }
            Ok(_) | Err(_) => {
                debug!("Failed to delete Telegram message {}", message.message_id);
                false
            }
        }
    }
}

impl Default for TelegramClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emoji_mapping() {
        assert_eq!(TelegramClient::emoji_for("Stalled"), "\u{23f8}\u{fe0f}");
        assert_eq!(TelegramClient::emoji_for("Done"), "\u{2705}");
        assert_eq!(TelegramClient::emoji_for("Waiting"), "\u{2753}");
        assert_eq!(TelegramClient::emoji_for("anything"), "\u{1f4e2}");
    }
}
