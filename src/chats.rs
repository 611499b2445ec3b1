//! Chat lifecycle: creation with model access checks, ownership-checked
//! lookup, selection and listing.

use crate::access::AccessPolicy;
use crate::error::{ChatError, Result, StorageError};
use crate::storage::Storage;
use crate::{ChatId, Conversation, User};

use std::collections::BTreeSet;
use std::sync::Arc;

pub struct Chats<S> {
    storage: Arc<S>,
    policy: Arc<AccessPolicy>,
    default_temperature: f32,
}

impl<S> Clone for Chats<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            policy: self.policy.clone(),
            default_temperature: self.default_temperature,
        }
    }
}

impl<S: Storage> Chats<S> {
    pub fn new(storage: Arc<S>, policy: Arc<AccessPolicy>, default_temperature: f32) -> Self {
        Self {
            storage,
            policy,
            default_temperature,
        }
    }

    /// Models the user may open a chat with, sorted.
    pub fn available_models(&self, user: &User) -> BTreeSet<String> {
        self.policy.available_models(user)
    }

    /// Create a chat with `model` and make it the user's current chat.
    pub async fn create_chat(&self, user: &User, model: &str) -> Result<Conversation> {
        let models = self.policy.available_models(user);
        if models.is_empty() {
            return Err(ChatError::NoAvailableModels.into());
        }
        if !models.contains(model) {
            return Err(ChatError::ModelNotAllowed(model.to_string()).into());
        }

        let chat = self
            .storage
            .create_chat(user.user_id, model, self.default_temperature)
            .await?;
        self.storage
            .set_user_last_chat(user.user_id, chat.chat_id)
            .await?;

        tracing::info!(user_id = %user.user_id, chat_id = %chat.chat_id, model, "created chat");

        Ok(chat)
    }

    /// Fetch a chat, refusing chats owned by someone else.
    pub async fn get_owned_chat(&self, user: &User, chat_id: ChatId) -> Result<Conversation> {
        let chat = self.storage.get_chat(chat_id).await?;
        if chat.user_id != user.user_id {
            return Err(ChatError::NotOwner(chat_id).into());
        }
        Ok(chat)
    }

    /// Switch the user's current chat.
    pub async fn select_chat(&self, user: &User, chat_id: ChatId) -> Result<Conversation> {
        let chat = self.get_owned_chat(user, chat_id).await?;
        self.storage
            .set_user_last_chat(user.user_id, chat_id)
            .await?;
        Ok(chat)
    }

    /// The chat free text is routed into. A dangling `last_chat` reads as
    /// no selection.
    pub async fn current_chat(&self, user: &User) -> Result<Conversation> {
        let Some(chat_id) = user.last_chat else {
            return Err(ChatError::NoChatSelected.into());
        };

        match self.get_owned_chat(user, chat_id).await {
            Err(crate::Error::Storage(StorageError::ChatNotFound(_))) => {
                tracing::warn!(user_id = %user.user_id, %chat_id, "selected chat no longer exists");
                Err(ChatError::NoChatSelected.into())
            }
            other => other,
        }
    }

    pub async fn list_chats(&self, user: &User) -> Result<Vec<Conversation>> {
        Ok(self.storage.list_chats_for_user(user.user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::{Error, UserRole};

    async fn setup(models: &[&str]) -> (Chats<MemoryStorage>, Arc<MemoryStorage>, User) {
        let storage = Arc::new(MemoryStorage::new());
        let policy = Arc::new(AccessPolicy::public_with_models(
            &[UserRole::Default],
            models.iter().copied(),
        ));
        let user_id = storage.create_user(1, &[]).await.unwrap();
        let user = storage.get_user(user_id).await.unwrap();
        (Chats::new(storage.clone(), policy, 0.7), storage, user)
    }

    #[tokio::test]
    async fn create_requires_some_model() {
        let (chats, storage, user) = setup(&[]).await;

        let error = chats.create_chat(&user, "gpt-test").await.unwrap_err();
        assert!(matches!(error, Error::Chat(ChatError::NoAvailableModels)));
        assert!(storage.list_chats_for_user(user.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_models_outside_the_roles() {
        let (chats, _storage, user) = setup(&["gpt-test"]).await;

        let error = chats.create_chat(&user, "gpt-other").await.unwrap_err();
        assert!(matches!(error, Error::Chat(ChatError::ModelNotAllowed(m)) if m == "gpt-other"));
    }

    #[tokio::test]
    async fn create_selects_the_new_chat() {
        let (chats, storage, user) = setup(&["gpt-test"]).await;

        let chat = chats.create_chat(&user, "gpt-test").await.unwrap();
        assert_eq!(chat.temperature, 0.7);

        let user = storage.get_user(user.user_id).await.unwrap();
        assert_eq!(user.last_chat, Some(chat.chat_id));
        let current = chats.current_chat(&user).await.unwrap();
        assert_eq!(current.chat_id, chat.chat_id);
    }

    #[tokio::test]
    async fn foreign_chats_are_refused() {
        let (chats, storage, owner) = setup(&["gpt-test"]).await;
        let chat = chats.create_chat(&owner, "gpt-test").await.unwrap();

        let intruder_id = storage.create_user(2, &[]).await.unwrap();
        let intruder = storage.get_user(intruder_id).await.unwrap();

        let error = chats.select_chat(&intruder, chat.chat_id).await.unwrap_err();
        assert!(matches!(error, Error::Chat(ChatError::NotOwner(id)) if id == chat.chat_id));
        assert_eq!(storage.get_user(intruder_id).await.unwrap().last_chat, None);
    }

    #[tokio::test]
    async fn missing_selection_reads_as_none() {
        let (chats, _storage, mut user) = setup(&["gpt-test"]).await;

        let error = chats.current_chat(&user).await.unwrap_err();
        assert!(matches!(error, Error::Chat(ChatError::NoChatSelected)));

        user.last_chat = Some(uuid::Uuid::new_v4());
        let error = chats.current_chat(&user).await.unwrap_err();
        assert!(matches!(error, Error::Chat(ChatError::NoChatSelected)));
    }
}
