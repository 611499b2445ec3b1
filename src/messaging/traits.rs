//! Messaging platform trait.

use crate::error::Result;
use crate::{InboundUpdate, PlatformChatId, PlatformMessageId};
use futures::Stream;
use std::pin::Pin;

/// Inbound update stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundUpdate> + Send>>;

/// One inline keyboard button. `data` comes back in the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardButton {
    pub label: String,
    pub data: String,
}

impl KeyboardButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Chat platform the bot talks through.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Start receiving updates.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send text, returning the id of the (last) message posted.
    fn send_text(
        &self,
        chat_id: PlatformChatId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<PlatformMessageId>> + Send;

    /// Replace the text of a message the bot sent earlier.
    fn edit_text(
        &self,
        chat_id: PlatformChatId,
        message_id: PlatformMessageId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn send_typing(
        &self,
        chat_id: PlatformChatId,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let _ = chat_id;
        async { Ok(()) }
    }

    /// Send text with an inline keyboard, one inner vec per row.
    fn send_keyboard(
        &self,
        chat_id: PlatformChatId,
        text: &str,
        rows: Vec<Vec<KeyboardButton>>,
    ) -> impl std::future::Future<Output = Result<PlatformMessageId>> + Send;

    /// Acknowledge a button press so the client stops its spinner.
    fn answer_callback(
        &self,
        query_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_message(
        &self,
        chat_id: PlatformChatId,
        message_id: PlatformMessageId,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Publish the command menu.
    fn register_commands(
        &self,
        commands: &[&str],
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let _ = commands;
        async { Ok(()) }
    }

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}
