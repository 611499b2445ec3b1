//! Chat and user persistence.
//!
//! Two backends implement [`Storage`]: an in-memory map store for tests and
//! throwaway runs, and a redb key-value store for real deployments. Lookups
//! return an explicit not-found variant of [`StorageError`] instead of a
//! default value, so callers can tell "create on first use" apart from a real
//! failure.

pub mod key_value;
pub mod memory;

pub use key_value::RedbStorage;
pub use memory::MemoryStorage;

use crate::error::StorageError;
use crate::{ChatId, Conversation, MessageSource, TelegramId, User, UserId, UserRole};

use std::future::Future;

/// Storage result type.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistent chat and user store.
///
/// Conversations are append-only: the only mutation is `append_message`.
pub trait Storage: Send + Sync + 'static {
    fn get_chat(&self, chat_id: ChatId) -> impl Future<Output = StorageResult<Conversation>> + Send;

    /// Create an empty chat owned by `user_id`.
    fn create_chat(
        &self,
        user_id: UserId,
        model: &str,
        temperature: f32,
    ) -> impl Future<Output = StorageResult<Conversation>> + Send;

    fn append_message(
        &self,
        chat_id: ChatId,
        text: &str,
        source: MessageSource,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Chats owned by `user_id`, in creation order.
    fn list_chats_for_user(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = StorageResult<Vec<Conversation>>> + Send;

    fn get_user(&self, user_id: UserId) -> impl Future<Output = StorageResult<User>> + Send;

    fn get_user_id_by_telegram(
        &self,
        telegram_id: TelegramId,
    ) -> impl Future<Output = StorageResult<UserId>> + Send;

    /// Register a telegram user. Fails with `UserAlreadyExists` on a repeat.
    fn create_user(
        &self,
        telegram_id: TelegramId,
        roles: &[UserRole],
    ) -> impl Future<Output = StorageResult<UserId>> + Send;

    fn set_user_last_chat(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> impl Future<Output = StorageResult<()>> + Send;
}

/// Roles as stored: always containing `Default`, without duplicates.
pub(crate) fn normalize_roles(roles: &[UserRole]) -> Vec<UserRole> {
    let mut normalized = vec![UserRole::Default];
    for role in roles {
        if !normalized.contains(role) {
            normalized.push(*role);
        }
    }
    normalized
}
