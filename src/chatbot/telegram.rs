//! Telegram delivery using teloxide.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::chatbot::collaborators::MessageSender;
use crate::chatbot::message::{RoomId, truncate_chars};
use crate::error::CollaboratorError;

/// Pause between consecutive segments of one reply.
const SEGMENT_DELAY: Duration = Duration::from_millis(600);

/// Telegram's limit on one message, in characters.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Whether an incoming message counts as a direct mention of the bot.
/// Everything said in a private chat is addressed to the bot.
pub fn is_direct_mention(text: &str, bot_username: &str, is_private: bool) -> bool {
    is_private || text.to_lowercase().contains(&format!("@{}", bot_username.to_lowercase()))
}

/// Sends reply segments as separate Telegram messages.
pub struct TelegramSender {
    bot: Bot,
}

impl TelegramSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send_one(&self, chat_id: i64, text: &str) -> Result<i64, CollaboratorError> {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|msg| msg.id.0 as i64)
            .map_err(|e| {
                warn!("Failed to send to {}: {}", chat_id, e);
                CollaboratorError::Send(e.to_string())
            })
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, room_id: RoomId, segments: &[String]) -> Result<(), CollaboratorError> {
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(SEGMENT_DELAY).await;
            }
            let msg_id = self.send_one(room_id, segment).await?;
            info!(
                "✅ Sent message {} to chat {}: \"{}\"",
                msg_id,
                room_id,
                truncate_chars(segment, 40)
            );
        }
        Ok(())
    }
}
