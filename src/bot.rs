//! Inbound update handling: commands, keyboard callbacks and free-text turns.

use crate::access::AccessPolicy;
use crate::accounts::Accounts;
use crate::chats::Chats;
use crate::config::PipelineConfig;
use crate::conversation::ContextBuilder;
use crate::conversation::tokens::SharedTokenCounter;
use crate::error::{ChatError, Error, Result, StorageError, TurnError};
use crate::llm::CompletionProvider;
use crate::locale::{self, Language, Phrase};
use crate::messaging::{ChatAnswerSink, InboundStream, KeyboardButton, Messaging};
use crate::pipeline::ConversationPipeline;
use crate::storage::Storage;
use crate::{ChatId, Conversation, InboundKind, InboundUpdate, PlatformChatId, PlatformMessageId, User};

use futures::StreamExt as _;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Commands shown in the platform's command menu.
pub const COMMANDS: &[&str] = &["help", "new", "chats", "select_chat"];

const MODEL_CALLBACK_PREFIX: &str = "model_";
const CHAT_CALLBACK_PREFIX: &str = "chat_";

/// Buttons per row of the model keyboard.
const MODEL_KEYBOARD_COLUMNS: usize = 2;

/// Characters of the last message shown on a chat button.
const CHAT_PREVIEW_CHARS: usize = 20;

/// Routes inbound updates to accounts, chats and the streaming pipeline.
pub struct BotHandler<S, M, P> {
    messaging: Arc<M>,
    accounts: Accounts<S>,
    chats: Chats<S>,
    pipeline: ConversationPipeline<S, P>,
    policy: Arc<AccessPolicy>,
    update_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<ChatId>>>,
}

/// Holds a chat's streaming slot. Dropping it frees the slot.
struct TurnGuard {
    chat_id: ChatId,
    in_flight: Arc<Mutex<HashSet<ChatId>>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.chat_id);
    }
}

impl<S, M, P> BotHandler<S, M, P>
where
    S: Storage,
    M: Messaging,
    P: CompletionProvider,
{
    pub fn new(
        messaging: Arc<M>,
        storage: Arc<S>,
        provider: Arc<P>,
        counter: SharedTokenCounter,
        policy: AccessPolicy,
        pipeline: PipelineConfig,
        default_temperature: f32,
    ) -> Self {
        let policy = Arc::new(policy);
        let context = ContextBuilder::new(counter, pipeline.token_budget);

        Self {
            messaging,
            accounts: Accounts::new(storage.clone(), policy.clone()),
            chats: Chats::new(storage.clone(), policy.clone(), default_temperature),
            pipeline: ConversationPipeline::new(
                storage,
                provider,
                context,
                pipeline.throttle_window,
            ),
            policy,
            update_timeout: pipeline.update_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume inbound updates until the stream ends, handling each in its
    /// own task.
    pub async fn run(self: Arc<Self>, mut inbound: InboundStream) {
        while let Some(update) = inbound.next().await {
            let handler = self.clone();
            tokio::spawn(async move {
                handler.handle_update(update).await;
            });
        }

        tracing::info!(adapter = self.messaging.name(), "inbound stream closed");
    }

    /// Handle one update. Every failure ends in a reply or a log line.
    pub async fn handle_update(&self, update: InboundUpdate) {
        if !self.policy.is_allowed(update.sender_id) {
            tracing::info!(sender_id = update.sender_id, "rejected user outside allowed roles");
            if let InboundKind::Callback { query_id, .. } = &update.kind {
                self.acknowledge(query_id).await;
            }
            self.reply_phrase(&update, Phrase::NoAccess).await;
            return;
        }

        let result = match &update.kind {
            // Streaming turns are not bound by the update timeout.
            InboundKind::Text(text) => self.handle_text(&update, text).await,
            InboundKind::Command { name } => {
                self.with_timeout(&update, self.handle_command(&update, name))
                    .await
            }
            InboundKind::Callback {
                query_id,
                data,
                message_id,
            } => {
                self.with_timeout(
                    &update,
                    self.handle_callback(&update, query_id, data, *message_id),
                )
                .await
            }
        };

        if let Err(error) = result {
            tracing::error!(
                chat_id = update.chat_id,
                sender_id = update.sender_id,
                %error,
                "failed to handle update"
            );
            self.reply_phrase(&update, Phrase::ServerError).await;
        }
    }

    async fn with_timeout(
        &self,
        update: &InboundUpdate,
        handling: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        match tokio::time::timeout(self.update_timeout, handling).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "update from chat {} timed out after {:?}",
                update.chat_id,
                self.update_timeout
            )
            .into()),
        }
    }

    async fn handle_command(&self, update: &InboundUpdate, name: &str) -> Result<()> {
        let language = update.language;
        tracing::debug!(chat_id = update.chat_id, command = name, "handling command");

        match name {
            "start" => {
                self.accounts.resolve_telegram_user(update.sender_id).await?;
                self.reply_phrase(update, Phrase::Start).await;
            }
            "help" => self.reply_phrase(update, Phrase::Help).await,
            "new" => {
                let user = self.accounts.resolve_telegram_user(update.sender_id).await?;
                self.send_model_keyboard(update, &user).await?;
            }
            "chats" => {
                let user = self.accounts.resolve_telegram_user(update.sender_id).await?;
                let Some(chats) = self.user_chats(update, &user).await else {
                    return Ok(());
                };

                let mut text = locale::chats_count(language, chats.len());
                for (index, chat) in chats.iter().enumerate() {
                    text.push_str(&locale::chat_summary_line(
                        language,
                        index + 1,
                        chat.messages.len(),
                        &chat.model,
                        chat.temperature,
                    ));
                }
                self.reply(update.chat_id, &text).await;
            }
            "select_chat" => {
                let user = self.accounts.resolve_telegram_user(update.sender_id).await?;
                let Some(chats) = self.user_chats(update, &user).await else {
                    return Ok(());
                };

                let rows = chats
                    .iter()
                    .map(|chat| vec![chat_button(language, chat)])
                    .collect();
                self.messaging
                    .send_keyboard(update.chat_id, Phrase::SelectChat.text(language), rows)
                    .await?;
            }
            _ => self.reply_phrase(update, Phrase::UnknownCommand).await,
        }

        Ok(())
    }

    async fn handle_callback(
        &self,
        update: &InboundUpdate,
        query_id: &str,
        data: &str,
        keyboard_message: Option<PlatformMessageId>,
    ) -> Result<()> {
        self.acknowledge(query_id).await;

        let language = update.language;
        let user = self.accounts.resolve_telegram_user(update.sender_id).await?;

        if let Some(model) = data.strip_prefix(MODEL_CALLBACK_PREFIX) {
            match self.chats.create_chat(&user, model).await {
                Ok(chat) => {
                    self.remove_keyboard(update.chat_id, keyboard_message).await;
                    self.reply(update.chat_id, &locale::started_chat(language, &chat.model))
                        .await;
                }
                Err(Error::Chat(ChatError::NoAvailableModels)) => {
                    self.reply_phrase(update, Phrase::NoAvailableModels).await;
                }
                Err(Error::Chat(ChatError::ModelNotAllowed(model))) => {
                    tracing::info!(user_id = %user.user_id, %model, "model selection refused");
                    self.reply_phrase(update, Phrase::NoAccessToModel).await;
                }
                Err(error) => return Err(error),
            }
        } else if let Some(raw_id) = data.strip_prefix(CHAT_CALLBACK_PREFIX) {
            let Ok(chat_id) = raw_id.parse::<ChatId>() else {
                tracing::warn!(data, "malformed chat callback");
                self.reply_phrase(update, Phrase::NoAccessToChat).await;
                return Ok(());
            };

            match self.chats.select_chat(&user, chat_id).await {
                Ok(chat) => {
                    self.remove_keyboard(update.chat_id, keyboard_message).await;
                    self.reply(update.chat_id, &locale::continued_chat(language, &chat.model))
                        .await;
                }
                Err(Error::Chat(ChatError::NotOwner(_)))
                | Err(Error::Storage(StorageError::ChatNotFound(_))) => {
                    tracing::info!(user_id = %user.user_id, %chat_id, "chat selection refused");
                    self.reply_phrase(update, Phrase::NoAccessToChat).await;
                }
                Err(error) => return Err(error),
            }
        } else {
            tracing::warn!(data, "unknown callback data");
        }

        Ok(())
    }

    async fn handle_text(&self, update: &InboundUpdate, text: &str) -> Result<()> {
        let user = self.accounts.resolve_telegram_user(update.sender_id).await?;

        let chat = match self.chats.current_chat(&user).await {
            Ok(chat) => chat,
            Err(Error::Chat(ChatError::NoChatSelected)) => {
                return self.send_model_keyboard(update, &user).await;
            }
            Err(Error::Chat(ChatError::NotOwner(_))) => {
                self.reply_phrase(update, Phrase::NoAccessToChat).await;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        if !self.policy.can_use_model(&user, &chat.model) {
            self.reply_phrase(update, Phrase::NoAccessToModel).await;
            return Ok(());
        }

        let Some(_turn) = self.try_begin_turn(chat.chat_id) else {
            tracing::debug!(chat_id = %chat.chat_id, "turn already in progress");
            self.reply_phrase(update, Phrase::TurnInProgress).await;
            return Ok(());
        };

        let sink = ChatAnswerSink::new(self.messaging.as_ref(), update.chat_id);
        match self.pipeline.run_turn(&chat, text, &sink).await {
            Ok(outcome) => {
                if outcome.answer.is_none() {
                    tracing::warn!(chat_id = %chat.chat_id, "no answer reached the user");
                    self.reply_phrase(update, Phrase::ServerError).await;
                }
                if outcome.trimmed {
                    self.reply_phrase(update, Phrase::ContextTrimmed).await;
                }
            }
            Err(TurnError::SaveUserMessage(error)) => {
                tracing::error!(chat_id = %chat.chat_id, %error, "failed to save user message");
                self.reply_phrase(update, Phrase::FailedToSaveMessage).await;
            }
            Err(error) => {
                tracing::error!(chat_id = %chat.chat_id, %error, "turn failed");
                self.reply_phrase(update, Phrase::ServerError).await;
            }
        }

        Ok(())
    }

    /// Claim the chat's streaming slot, or `None` if a turn is running.
    fn try_begin_turn(&self, chat_id: ChatId) -> Option<TurnGuard> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        in_flight.insert(chat_id).then(|| TurnGuard {
            chat_id,
            in_flight: self.in_flight.clone(),
        })
    }

    async fn send_model_keyboard(&self, update: &InboundUpdate, user: &User) -> Result<()> {
        let models = self.chats.available_models(user);
        if models.is_empty() {
            self.reply_phrase(update, Phrase::NoAvailableModels).await;
            return Ok(());
        }

        let models: Vec<&String> = models.iter().collect();
        let rows = models
            .chunks(MODEL_KEYBOARD_COLUMNS)
            .map(|row| {
                row.iter()
                    .map(|model| {
                        KeyboardButton::new(*model, format!("{MODEL_CALLBACK_PREFIX}{model}"))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        self.messaging
            .send_keyboard(update.chat_id, Phrase::SelectModel.text(update.language), rows)
            .await?;
        Ok(())
    }

    /// The user's chats, or `None` after replying that there are none or
    /// that they could not be loaded.
    async fn user_chats(&self, update: &InboundUpdate, user: &User) -> Option<Vec<Conversation>> {
        match self.chats.list_chats(user).await {
            Ok(chats) if chats.is_empty() => {
                self.reply_phrase(update, Phrase::NoChats).await;
                None
            }
            Ok(chats) => Some(chats),
            Err(error) => {
                tracing::error!(user_id = %user.user_id, %error, "failed to list chats");
                self.reply_phrase(update, Phrase::FailedToGetChats).await;
                None
            }
        }
    }

    async fn acknowledge(&self, query_id: &str) {
        if let Err(error) = self.messaging.answer_callback(query_id).await {
            tracing::debug!(%error, "failed to answer callback query");
        }
    }

    async fn remove_keyboard(&self, chat_id: PlatformChatId, message_id: Option<PlatformMessageId>) {
        let Some(message_id) = message_id else {
            return;
        };
        if let Err(error) = self.messaging.delete_message(chat_id, message_id).await {
            tracing::debug!(chat_id, message_id, %error, "failed to delete keyboard message");
        }
    }

    async fn reply_phrase(&self, update: &InboundUpdate, phrase: Phrase) {
        self.reply(update.chat_id, phrase.text(update.language)).await;
    }

    async fn reply(&self, chat_id: PlatformChatId, text: &str) {
        if let Err(error) = self.messaging.send_text(chat_id, text).await {
            tracing::warn!(chat_id, %error, "failed to send reply");
        }
    }
}

fn chat_button(language: Language, chat: &Conversation) -> KeyboardButton {
    let preview: String = chat
        .messages
        .last()
        .map(|message| message.body.chars().take(CHAT_PREVIEW_CHARS).collect())
        .unwrap_or_default();

    KeyboardButton::new(
        locale::chat_button_label(language, &chat.model, &preview, chat.messages.len()),
        format!("{CHAT_CALLBACK_PREFIX}{}", chat.chat_id),
    )
}
