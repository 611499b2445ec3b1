//! Persistent key-value storage backend (redb).
//!
//! One table maps string keys to JSON documents:
//!
//! - `chat_{uuid}` -> [`Conversation`]
//! - `user_chats_{uuid}` -> list of chat ids owned by the user
//! - `user_{uuid}` -> [`User`]
//! - `telegram_{id}` -> user id

use crate::error::StorageError;
use crate::storage::{Storage, StorageResult, normalize_roles};
use crate::{ChatId, Conversation, Message, MessageSource, TelegramId, User, UserId, UserRole};

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("kv");

fn chat_key(chat_id: ChatId) -> String {
    format!("chat_{chat_id}")
}

fn user_chats_key(user_id: UserId) -> String {
    format!("user_chats_{user_id}")
}

fn user_key(user_id: UserId) -> String {
    format!("user_{user_id}")
}

fn telegram_key(telegram_id: TelegramId) -> String {
    format!("telegram_{telegram_id}")
}

fn backend(error: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(error.to_string())
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static str>,
    key: &str,
) -> StorageResult<Option<T>> {
    let Some(raw) = table.get(key).map_err(backend)? else {
        return Ok(None);
    };
    serde_json::from_str(raw.value())
        .map(Some)
        .map_err(|error| StorageError::Codec {
            key: key.to_string(),
            details: error.to_string(),
        })
}

fn put_json<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static str>,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let raw = serde_json::to_string(value).map_err(|error| StorageError::Codec {
        key: key.to_string(),
        details: error.to_string(),
    })?;
    table.insert(key, raw.as_str()).map_err(backend)?;
    Ok(())
}

/// redb-backed [`Storage`].
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open the database at `path`, creating the file and table if missing.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                StorageError::Backend(format!(
                    "failed to create storage directory {}: {error}",
                    parent.display()
                ))
            })?;
        }

        let db = Database::create(path).map_err(backend)?;

        // Read transactions fail on a table that was never created.
        let write_txn = db.begin_write().map_err(backend)?;
        {
            let _ = write_txn.open_table(KV_TABLE).map_err(backend)?;
        }
        write_txn.commit().map_err(backend)?;

        tracing::info!(path = %path.display(), "opened redb storage");

        Ok(Self { db: Arc::new(db) })
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(KV_TABLE).map_err(backend)?;
        get_json(&table, key)
    }
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

impl Storage for RedbStorage {
    async fn get_chat(&self, chat_id: ChatId) -> StorageResult<Conversation> {
        self.read(&chat_key(chat_id))?
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

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(backend)?;
            put_json(&mut table, &chat_key(chat.chat_id), &chat)?;

            let list_key = user_chats_key(user_id);
            let mut chat_ids: Vec<ChatId> = get_json(&table, &list_key)?.unwrap_or_default();
            chat_ids.push(chat.chat_id);
            put_json(&mut table, &list_key, &chat_ids)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(chat)
    }

    async fn append_message(
        &self,
        chat_id: ChatId,
        text: &str,
        source: MessageSource,
    ) -> StorageResult<()> {
        let key = chat_key(chat_id);

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(backend)?;
            let mut chat: Conversation =
                get_json(&table, &key)?.ok_or(StorageError::ChatNotFound(chat_id))?;
            chat.messages.push(Message {
                source,
                body: text.to_string(),
            });
            put_json(&mut table, &key, &chat)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(())
    }

    async fn list_chats_for_user(&self, user_id: UserId) -> StorageResult<Vec<Conversation>> {
        let read_txn = self.db.begin_read().map_err(backend)?;
        let table = read_txn.open_table(KV_TABLE).map_err(backend)?;

        let chat_ids: Vec<ChatId> = get_json(&table, &user_chats_key(user_id))?.unwrap_or_default();

        let mut chats = Vec::with_capacity(chat_ids.len());
        for chat_id in chat_ids {
            match get_json::<Conversation>(&table, &chat_key(chat_id))? {
                Some(chat) => chats.push(chat),
                None => {
                    tracing::warn!(%user_id, %chat_id, "user chat list points at a missing chat");
                }
            }
        }

        Ok(chats)
    }

    async fn get_user(&self, user_id: UserId) -> StorageResult<User> {
        self.read(&user_key(user_id))?
            .ok_or(StorageError::UserNotFound(user_id))
    }

    async fn get_user_id_by_telegram(&self, telegram_id: TelegramId) -> StorageResult<UserId> {
        self.read(&telegram_key(telegram_id))?
            .ok_or(StorageError::TelegramUserNotFound(telegram_id))
    }

    async fn create_user(
        &self,
        telegram_id: TelegramId,
        roles: &[UserRole],
    ) -> StorageResult<UserId> {
        let user = User {
            user_id: uuid::Uuid::new_v4(),
            telegram_id,
            roles: normalize_roles(roles),
            last_chat: None,
        };

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(backend)?;
            let telegram = telegram_key(telegram_id);
            if get_json::<UserId>(&table, &telegram)?.is_some() {
                return Err(StorageError::UserAlreadyExists(telegram_id));
            }
            put_json(&mut table, &telegram, &user.user_id)?;
            put_json(&mut table, &user_key(user.user_id), &user)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(user.user_id)
    }

    async fn set_user_last_chat(&self, user_id: UserId, chat_id: ChatId) -> StorageResult<()> {
        let key = user_key(user_id);

        let write_txn = self.db.begin_write().map_err(backend)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(backend)?;
            let mut user: User =
                get_json(&table, &key)?.ok_or(StorageError::UserNotFound(user_id))?;
            user.last_chat = Some(chat_id);
            put_json(&mut table, &key, &user)?;
        }
        write_txn.commit().map_err(backend)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    fn open_temp() -> (tempfile::TempDir, RedbStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RedbStorage::open(&dir.path().join("nested/relaybot.redb")).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn chats_are_append_only_and_ordered() {
        let (_dir, storage) = open_temp();
        conformance::chats_are_append_only_and_ordered(&storage).await;
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let (_dir, storage) = open_temp();
        conformance::missing_records_are_not_found(&storage).await;
    }

    #[tokio::test]
    async fn users_are_unique_per_telegram_id() {
        let (_dir, storage) = open_temp();
        conformance::users_are_unique_per_telegram_id(&storage).await;
    }

    #[tokio::test]
    async fn chats_are_listed_per_owner() {
        let (_dir, storage) = open_temp();
        conformance::chats_are_listed_per_owner(&storage).await;
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaybot.redb");

        let (user_id, chat_id) = {
            let storage = RedbStorage::open(&path).unwrap();
            let user_id = storage.create_user(7, &[UserRole::Admin]).await.unwrap();
            let chat = storage.create_chat(user_id, "gpt-test", 1.0).await.unwrap();
            storage
                .append_message(chat.chat_id, "remember me", MessageSource::User)
                .await
                .unwrap();
            (user_id, chat.chat_id)
        };

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.get_user_id_by_telegram(7).await.unwrap(), user_id);
        let chat = storage.get_chat(chat_id).await.unwrap();
        assert_eq!(chat.messages, vec![Message::user("remember me")]);
    }
}
