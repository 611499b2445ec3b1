//! Telegram user registration.

use crate::access::AccessPolicy;
use crate::error::StorageError;
use crate::storage::{Storage, StorageResult};
use crate::{TelegramId, User, UserId};

use std::sync::Arc;

/// Resolves platform identities into stored users, creating them on first
/// contact.
pub struct Accounts<S> {
    storage: Arc<S>,
    policy: Arc<AccessPolicy>,
}

impl<S> Clone for Accounts<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S: Storage> Accounts<S> {
    pub fn new(storage: Arc<S>, policy: Arc<AccessPolicy>) -> Self {
        Self { storage, policy }
    }

    /// Look up the user behind `telegram_id`, registering them with their
    /// first-contact roles if unknown.
    pub async fn resolve_telegram_user(&self, telegram_id: TelegramId) -> StorageResult<User> {
        let user_id = match self.storage.get_user_id_by_telegram(telegram_id).await {
            Ok(user_id) => user_id,
            Err(StorageError::TelegramUserNotFound(_)) => self.register(telegram_id).await?,
            Err(error) => return Err(error),
        };

        self.storage.get_user(user_id).await
    }

    async fn register(&self, telegram_id: TelegramId) -> StorageResult<UserId> {
        let roles = self.policy.roles_for(telegram_id);
        match self.storage.create_user(telegram_id, &roles).await {
            Ok(user_id) => {
                tracing::info!(telegram_id, %user_id, ?roles, "registered new user");
                Ok(user_id)
            }
            // Two updates from a new user raced; the other one won.
            Err(StorageError::UserAlreadyExists(_)) => {
                self.storage.get_user_id_by_telegram(telegram_id).await
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserRole;
    use crate::config::TelegramConfig;
    use crate::storage::MemoryStorage;
    use std::collections::HashMap;

    fn accounts() -> (Arc<MemoryStorage>, Accounts<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let telegram = TelegramConfig {
            token: String::new(),
            is_public: true,
            admin_ids: vec![100],
            premium_ids: vec![],
            available_for_roles: vec![],
        };
        let policy = Arc::new(AccessPolicy::new(&telegram, HashMap::new()));
        (storage.clone(), Accounts::new(storage, policy))
    }

    #[tokio::test]
    async fn first_contact_creates_user_once() {
        let (storage, accounts) = accounts();

        let first = accounts.resolve_telegram_user(100).await.unwrap();
        assert_eq!(first.roles, vec![UserRole::Default, UserRole::Admin]);

        let second = accounts.resolve_telegram_user(100).await.unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(storage.get_user_id_by_telegram(100).await.unwrap(), first.user_id);
    }

    #[tokio::test]
    async fn resolved_user_reflects_last_chat() {
        let (storage, accounts) = accounts();
        let user = accounts.resolve_telegram_user(5).await.unwrap();
        let chat = storage.create_chat(user.user_id, "gpt-test", 1.0).await.unwrap();

        storage.set_user_last_chat(user.user_id, chat.chat_id).await.unwrap();

        let user = accounts.resolve_telegram_user(5).await.unwrap();
        assert_eq!(user.last_chat, Some(chat.chat_id));
    }
}
