//! Relaybot: a Telegram front-end that streams chat-completion answers back
//! to the user as a rate-limited sequence of message edits.

pub mod access;
pub mod accounts;
pub mod bot;
pub mod chats;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod locale;
pub mod messaging;
pub mod pipeline;
pub mod storage;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Conversation identifier type.
pub type ChatId = uuid::Uuid;

/// Internal user identifier type.
pub type UserId = uuid::Uuid;

/// Telegram user identifier.
pub type TelegramId = i64;

/// Platform-side chat identifier (the Telegram chat the bot replies into).
pub type PlatformChatId = i64;

/// Platform-side message identifier, used as the dispatch cursor.
pub type PlatformMessageId = i32;

/// Who authored a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    User,
    Assistant,
}

impl MessageSource {
    /// Role name as chat-completion APIs spell it.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::User => "user",
            MessageSource::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged entry of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub source: MessageSource,
    pub body: String,
}

impl Message {
    pub fn user(body: impl Into<String>) -> Self {
        Self {
            source: MessageSource::User,
            body: body.into(),
        }
    }

    pub fn assistant(body: impl Into<String>) -> Self {
        Self {
            source: MessageSource::Assistant,
            body: body.into(),
        }
    }
}

/// A chat with one model, owned by one user.
///
/// `model` and `temperature` are fixed at creation. `messages` only grows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
}

/// Access roles. Every user holds `Default`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Default,
    Admin,
    Premium,
}

impl UserRole {
    /// Parse a role name from config. Unknown names map to `Default`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => UserRole::Admin,
            "premium" => UserRole::Premium,
            _ => UserRole::Default,
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRole::Default => write!(f, "default"),
            UserRole::Admin => write!(f, "admin"),
            UserRole::Premium => write!(f, "premium"),
        }
    }
}

/// A registered bot user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub telegram_id: TelegramId,
    pub roles: Vec<UserRole>,
    /// The chat free-text messages are routed into.
    pub last_chat: Option<ChatId>,
}

/// Inbound update from the messaging platform, already stripped of
/// platform-specific types.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub chat_id: PlatformChatId,
    pub sender_id: TelegramId,
    pub language: locale::Language,
    pub kind: InboundKind,
}

/// What the user did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// `/name`, lowercased, with any `@botname` suffix and arguments removed.
    Command { name: String },
    /// Free text to relay to the model.
    Text(String),
    /// An inline keyboard button press.
    Callback {
        query_id: String,
        data: String,
        message_id: Option<PlatformMessageId>,
    },
}

impl InboundKind {
    /// Classify raw message text as a command or free text.
    pub fn from_text(text: &str) -> Self {
        let Some(rest) = text.strip_prefix('/') else {
            return InboundKind::Text(text.to_string());
        };

        let head = rest.split(char::is_whitespace).next().unwrap_or(rest);
        let name = head.split('@').next().unwrap_or(head);

        if name.is_empty() {
            return InboundKind::Text(text.to_string());
        }

        InboundKind::Command {
            name: name.to_ascii_lowercase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_drop_bot_suffix_and_arguments() {
        assert_eq!(
            InboundKind::from_text("/new@relay_bot gpt-4o"),
            InboundKind::Command { name: "new".into() }
        );
        assert_eq!(
            InboundKind::from_text("/Help"),
            InboundKind::Command { name: "help".into() }
        );
    }

    #[test]
    fn plain_text_and_lone_slash_are_text() {
        assert_eq!(
            InboundKind::from_text("hello /new"),
            InboundKind::Text("hello /new".into())
        );
        assert_eq!(InboundKind::from_text("/"), InboundKind::Text("/".into()));
    }

    #[test]
    fn unknown_roles_parse_as_default() {
        assert_eq!(UserRole::parse("Admin"), UserRole::Admin);
        assert_eq!(UserRole::parse("premium"), UserRole::Premium);
        assert_eq!(UserRole::parse("guest"), UserRole::Default);
    }
}
