//! In-memory storage backend. Everything is lost on restart.

use crate::error::StorageError;
use crate::storage::{Storage, StorageResult, normalize_roles};
use crate::{ChatId, Conversation, Message, MessageSource, TelegramId, User, UserId, UserRole};

use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    chats: HashMap<ChatId, Conversation>,
    user_chats: HashMap<UserId, Vec<ChatId>>,
    users: HashMap<UserId, User>,
    telegram_users: HashMap<TelegramId, UserId>,
}

/// Map-backed [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

impl Storage for MemoryStorage {
    async fn get_chat(&self, chat_id: ChatId) -> StorageResult<Conversation> {
        self.inner
            .read()
            .await
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or(StorageError::ChatNotFound(chat_id))
    }

    async fn create_chat(
        &self,
        user_id: UserId,
        model: &str,
        temperature: f32,
    ) -> StorageResult<Conversation> {
        let chat = Conversation {
            chat_id: uuid::Uuid::new_v4(),
            user_id,
            model: model.to_string(),
            temperature,
            messages: Vec::new(),
        };

        let mut inner = self.inner.write().await;
        inner.chats.insert(chat.chat_id, chat.clone());
        inner.user_chats.entry(user_id).or_default().push(chat.chat_id);

        Ok(chat)
    }

    async fn append_message(
        &self,
        chat_id: ChatId,
        text: &str,
        source: MessageSource,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let chat = inner
            .chats
            .get_mut(&chat_id)
            .ok_or(StorageError::ChatNotFound(chat_id))?;
        chat.messages.push(Message {
            source,
            body: text.to_string(),
        });
        Ok(())
    }

    async fn list_chats_for_user(&self, user_id: UserId) -> StorageResult<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let Some(chat_ids) = inner.user_chats.get(&user_id) else {
            return Ok(Vec::new());
        };

        Ok(chat_ids
            .iter()
            .filter_map(|chat_id| inner.chats.get(chat_id).cloned())
            .collect())
    }

    async fn get_user(&self, user_id: UserId) -> StorageResult<User> {
        self.inner
            .read()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StorageError::UserNotFound(user_id))
    }

    async fn get_user_id_by_telegram(&self, telegram_id: TelegramId) -> StorageResult<UserId> {
        self.inner
            .read()
            .await
            .telegram_users
            .get(&telegram_id)
            .copied()
            .ok_or(StorageError::TelegramUserNotFound(telegram_id))
    }

    async fn create_user(
        &self,
        telegram_id: TelegramId,
        roles: &[UserRole],
    ) -> StorageResult<UserId> {
        let mut inner = self.inner.write().await;
        if inner.telegram_users.contains_key(&telegram_id) {
            return Err(StorageError::UserAlreadyExists(telegram_id));
        }

        let user = User {
            user_id: uuid::Uuid::new_v4(),
            telegram_id,
            roles: normalize_roles(roles),
            last_chat: None,
        };
        let user_id = user.user_id;
        inner.telegram_users.insert(telegram_id, user_id);
        inner.users.insert(user_id, user);

        Ok(user_id)
    }

    async fn set_user_last_chat(&self, user_id: UserId, chat_id: ChatId) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StorageError::UserNotFound(user_id))?;
        user.last_chat = Some(chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    #[tokio::test]
    async fn chats_are_append_only_and_ordered() {
        conformance::chats_are_append_only_and_ordered(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        conformance::missing_records_are_not_found(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn users_are_unique_per_telegram_id() {
        conformance::users_are_unique_per_telegram_id(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn chats_are_listed_per_owner() {
        conformance::chats_are_listed_per_owner(&MemoryStorage::new()).await;
    }
}
