//! Top-level error types for relaybot.

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error. Domain errors convert into it with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {details}")]
    Invalid { key: &'static str, details: String },
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("chat {0} does not exist")]
    ChatNotFound(uuid::Uuid),

    #[error("user {0} does not exist")]
    UserNotFound(uuid::Uuid),

    #[error("no user registered for telegram id {0}")]
    TelegramUserNotFound(i64),

    #[error("user with telegram id {0} already exists")]
    UserAlreadyExists(i64),

    #[error("failed to encode or decode {key}: {details}")]
    Codec { key: String, details: String },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Completion provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    Request(String),

    #[error("completion API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("completion stream failed: {0}")]
    Stream(String),
}

/// Chat domain errors. Rendered to the user, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("user roles grant no models")]
    NoAvailableModels,

    #[error("user has no access to model {0}")]
    ModelNotAllowed(String),

    #[error("chat {0} belongs to another user")]
    NotOwner(uuid::Uuid),

    #[error("no chat selected yet")]
    NoChatSelected,
}

/// Failure of one streamed turn, tagged with the step that failed.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("failed to save user message: {0}")]
    SaveUserMessage(#[source] StorageError),

    #[error(transparent)]
    Completion(#[from] LlmError),

    #[error("failed to save answer: {0}")]
    SaveAnswer(#[source] StorageError),
}
