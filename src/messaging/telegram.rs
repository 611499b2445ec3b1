//! Telegram messaging adapter using teloxide.

use crate::locale::{self, Language};
use crate::messaging::traits::{InboundStream, KeyboardButton, Messaging};
use crate::{InboundKind, InboundUpdate, PlatformChatId, PlatformMessageId};

use anyhow::Context as _;
use teloxide::Bot;
use teloxide::payloads::setters::*;
use teloxide::requests::{Request, Requester};
use teloxide::types::{
    BotCommand, CallbackQuery, ChatAction, ChatId, InlineKeyboardButton, InlineKeyboardMarkup,
    MediaKind, MessageId, MessageKind, ParseMode, UpdateKind, UserId,
};

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};

/// Telegram adapter state.
pub struct TelegramAdapter {
    bot: Bot,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
    /// Shutdown signal for the polling loop.
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

/// Telegram's per-message character limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_LONG_POLL_TIMEOUT_SECS: u32 = 30;
const TELEGRAM_HTTP_TIMEOUT: Duration = Duration::from_secs(35);
const TELEGRAM_GET_UPDATES_RETRY_DELAY: Duration = Duration::from_secs(5);

fn build_telegram_http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(TELEGRAM_HTTP_TIMEOUT)
        .tcp_nodelay(true);

    if let Ok(proxy) = std::env::var("TELOXIDE_PROXY") {
        match reqwest::Proxy::all(proxy) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(error) => {
                tracing::warn!(%error, "invalid TELOXIDE_PROXY URL; using direct Telegram connection");
            }
        }
    }

    match builder.build() {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(%error, "failed to build telegram HTTP client, falling back to default client");
            reqwest::Client::new()
        }
    }
}

impl TelegramAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        let bot = Bot::with_client(token.into(), build_telegram_http_client());
        Self {
            bot,
            bot_user_id: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Send one message with Markdown, falling back to plain text if
    /// Telegram rejects the markup.
    #[allow(deprecated)]
    async fn send_formatted(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> anyhow::Result<teloxide::types::Message> {
        match self
            .bot
            .send_message(chat_id, normalize_markdown(text))
            .parse_mode(ParseMode::Markdown)
            .send()
            .await
        {
            Ok(message) => Ok(message),
            Err(error) => {
                tracing::debug!(%error, "markdown send rejected, retrying as plain text");
                self.bot
                    .send_message(chat_id, text)
                    .send()
                    .await
                    .context("failed to send telegram message")
            }
        }
    }
}

impl Messaging for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let me = self
            .bot
            .get_me()
            .send()
            .await
            .context("failed to call getMe on Telegram")?;
        *self.bot_user_id.write().await = Some(me.id);
        tracing::info!(
            bot_name = %me.first_name,
            bot_username = ?me.username,
            "telegram connected"
        );

        let bot = self.bot.clone();
        let bot_user_id = self.bot_user_id.clone();

        tokio::spawn(async move {
            let mut offset = 0i32;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("telegram polling loop shutting down");
                        break;
                    }
                    result = async {
                        let request_started = Instant::now();
                        let result = bot
                            .get_updates()
                            .offset(offset)
                            .timeout(TELEGRAM_LONG_POLL_TIMEOUT_SECS)
                            .send()
                            .await;
                        (request_started, result)
                    } => {
                        let (request_started, result) = result;
                        let updates = match result {
                            Ok(updates) => updates,
                            Err(error) => {
                                tracing::error!(
                                    %error,
                                    elapsed_ms = request_started.elapsed().as_millis(),
                                    retry_delay_secs = TELEGRAM_GET_UPDATES_RETRY_DELAY.as_secs(),
                                    "telegram getUpdates failed"
                                );
                                tokio::time::sleep(TELEGRAM_GET_UPDATES_RETRY_DELAY).await;
                                continue;
                            }
                        };

                        let bot_id = *bot_user_id.read().await;

                        for update in updates {
                            offset = update.id.as_offset() as i32;

                            let inbound = match &update.kind {
                                UpdateKind::Message(message) => convert_message(message, bot_id),
                                UpdateKind::CallbackQuery(query) => convert_callback(query),
                                _ => None,
                            };
                            let Some(inbound) = inbound else {
                                continue;
                            };

                            if let Err(error) = inbound_tx.send(inbound).await {
                                tracing::warn!(
                                    %error,
                                    "failed to forward telegram update (receiver dropped)"
                                );
                                return;
                            }
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn send_text(
        &self,
        chat_id: PlatformChatId,
        text: &str,
    ) -> crate::Result<PlatformMessageId> {
        let chat_id = ChatId(chat_id);
        let mut last_id = None;

        for chunk in split_message(text, MAX_MESSAGE_LENGTH) {
            let message = self.send_formatted(chat_id, &chunk).await?;
            last_id = Some(message.id.0);
        }

        Ok(last_id.context("refused to send an empty telegram message")?)
    }

    #[allow(deprecated)]
    async fn edit_text(
        &self,
        chat_id: PlatformChatId,
        message_id: PlatformMessageId,
        text: &str,
    ) -> crate::Result<()> {
        let chat_id = ChatId(chat_id);
        let message_id = MessageId(message_id);
        let text = truncate_for_edit(text);

        let formatted = self
            .bot
            .edit_message_text(chat_id, message_id, normalize_markdown(&text))
            .parse_mode(ParseMode::Markdown)
            .send()
            .await;

        if let Err(error) = formatted {
            tracing::debug!(%error, "markdown edit rejected, retrying as plain text");
            self.bot
                .edit_message_text(chat_id, message_id, text.into_owned())
                .send()
                .await
                .context("failed to edit telegram message")?;
        }

        Ok(())
    }

    async fn send_typing(&self, chat_id: PlatformChatId) -> crate::Result<()> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .send()
            .await
            .context("failed to send typing indicator")?;
        Ok(())
    }

    async fn send_keyboard(
        &self,
        chat_id: PlatformChatId,
        text: &str,
        rows: Vec<Vec<KeyboardButton>>,
    ) -> crate::Result<PlatformMessageId> {
        let markup = InlineKeyboardMarkup::new(rows.into_iter().map(|row| {
            row.into_iter()
                .map(|button| InlineKeyboardButton::callback(button.label, button.data))
                .collect::<Vec<_>>()
        }));

        let message = self
            .bot
            .send_message(ChatId(chat_id), text)
            .reply_markup(markup)
            .send()
            .await
            .context("failed to send telegram keyboard")?;

        Ok(message.id.0)
    }

    async fn answer_callback(&self, query_id: &str) -> crate::Result<()> {
        self.bot
            .answer_callback_query(query_id.to_string())
            .send()
            .await
            .context("failed to answer telegram callback query")?;
        Ok(())
    }

    async fn delete_message(
        &self,
        chat_id: PlatformChatId,
        message_id: PlatformMessageId,
    ) -> crate::Result<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id))
            .send()
            .await
            .context("failed to delete telegram message")?;
        Ok(())
    }

    async fn register_commands(&self, commands: &[&str]) -> crate::Result<()> {
        for language in [Language::English, Language::Russian] {
            let menu: Vec<BotCommand> = commands
                .iter()
                .map(|command| {
                    BotCommand::new(*command, locale::command_description(command, language))
                })
                .collect();

            let request = self.bot.set_my_commands(menu);
            let result = match language {
                Language::English => request.send().await,
                Language::Russian => request.language_code(language.code()).send().await,
            };
            result.with_context(|| {
                format!("failed to register telegram commands for {}", language.code())
            })?;
        }

        tracing::info!(count = commands.len(), "telegram commands registered");
        Ok(())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }

        tracing::info!("telegram adapter shut down");
        Ok(())
    }
}

// -- Helper functions --

/// Convert a chat message into an update. Skips the bot's own messages and
/// anything without text.
fn convert_message(
    message: &teloxide::types::Message,
    bot_id: Option<UserId>,
) -> Option<InboundUpdate> {
    let from = message.from.as_ref()?;
    if bot_id.is_some_and(|id| from.id == id) {
        return None;
    }

    let text = extract_text(message)?;

    Some(InboundUpdate {
        chat_id: message.chat.id.0,
        sender_id: from.id.0 as i64,
        language: Language::from_code(from.language_code.as_deref()),
        kind: InboundKind::from_text(&text),
    })
}

fn convert_callback(query: &CallbackQuery) -> Option<InboundUpdate> {
    let data = query.data.clone()?;
    let sender_id = query.from.id.0 as i64;

    // Without the originating message (inline mode) reply in the private chat.
    let (chat_id, message_id) = match &query.message {
        Some(message) => (message.chat().id.0, Some(message.id().0)),
        None => (sender_id, None),
    };

    Some(InboundUpdate {
        chat_id,
        sender_id,
        language: Language::from_code(query.from.language_code.as_deref()),
        kind: InboundKind::Callback {
            query_id: query.id.clone(),
            data,
            message_id,
        },
    })
}

/// Extract text content from a Telegram message.
fn extract_text(message: &teloxide::types::Message) -> Option<String> {
    match &message.kind {
        MessageKind::Common(common) => match &common.media_kind {
            MediaKind::Text(text) => Some(text.text.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Map the double-character emphasis models like to emit onto Telegram's
/// legacy Markdown markers.
fn normalize_markdown(text: &str) -> String {
    text.replace("**", "*").replace("__", "_")
}

/// Byte index of the `max_chars`-th character, or `None` if the text is
/// shorter.
fn char_boundary(text: &str, max_chars: usize) -> Option<usize> {
    text.char_indices().nth(max_chars).map(|(index, _)| index)
}

/// Cut text that no longer fits one message, marking the cut with `...`.
fn truncate_for_edit(text: &str) -> Cow<'_, str> {
    match char_boundary(text, MAX_MESSAGE_LENGTH) {
        None => Cow::Borrowed(text),
        Some(_) => {
            let end = char_boundary(text, MAX_MESSAGE_LENGTH - 3).unwrap_or(text.len());
            Cow::Owned(format!("{}...", &text[..end]))
        }
    }
}

/// Split a message into chunks that fit within Telegram's character limit.
/// Tries to split at newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some(limit) = char_boundary(remaining, max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&index| index > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
