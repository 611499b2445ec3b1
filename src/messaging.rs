//! Messaging adapters.

pub mod telegram;
pub mod traits;

pub use telegram::TelegramAdapter;
pub use traits::{InboundStream, KeyboardButton, Messaging};

use crate::pipeline::AnswerSink;
use crate::{PlatformChatId, PlatformMessageId};

/// Streams a turn's answer into one platform chat.
pub struct ChatAnswerSink<'a, M> {
    messaging: &'a M,
    chat_id: PlatformChatId,
}

impl<'a, M: Messaging> ChatAnswerSink<'a, M> {
    pub fn new(messaging: &'a M, chat_id: PlatformChatId) -> Self {
        Self { messaging, chat_id }
    }
}

impl<M: Messaging> AnswerSink for ChatAnswerSink<'_, M> {
    async fn create(&self, text: &str) -> anyhow::Result<PlatformMessageId> {
        Ok(self.messaging.send_text(self.chat_id, text).await?)
    }

    async fn edit(&self, message_id: PlatformMessageId, text: &str) -> anyhow::Result<()> {
        Ok(self.messaging.edit_text(self.chat_id, message_id, text).await?)
    }

    async fn typing(&self) -> anyhow::Result<()> {
        Ok(self.messaging.send_typing(self.chat_id).await?)
    }
}
