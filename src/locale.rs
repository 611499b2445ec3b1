//! User-visible strings in English and Russian.

/// Language of user-facing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    English,
    Russian,
}

impl Language {
    /// Pick a language from a Telegram `language_code`. Anything but Russian
    /// falls back to English.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some(code) if code.eq_ignore_ascii_case("ru") || code.starts_with("ru-") => {
                Language::Russian
            }
            _ => Language::English,
        }
    }

    /// IETF code, as Telegram's `setMyCommands` expects it.
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Russian => "ru",
        }
    }
}

/// Fixed replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phrase {
    ServerError,
    NoAvailableModels,
    FailedToSaveMessage,
    ContextTrimmed,
    NoAccess,
    NoAccessToChat,
    NoAccessToModel,
    Start,
    Help,
    UnknownCommand,
    SelectModel,
    SelectChat,
    FailedToGetChats,
    NoChats,
    TurnInProgress,
}

impl Phrase {
    pub fn text(self, language: Language) -> &'static str {
        use Language::*;
        use Phrase::*;

        match (self, language) {
            (ServerError, English) => "Something wrong with me. Try later.",
            (ServerError, Russian) => "У меня что-то не работает. Проверьте позже.",
            (NoAvailableModels, English) => "You dont have any available models.",
            (NoAvailableModels, Russian) => "У вас нет доступа к каким-либо моделям.",
            (FailedToSaveMessage, English) => "Failed to save your message. Try later.",
            (FailedToSaveMessage, Russian) => {
                "Не удалось сохранить ваше сообщение. Попробуйте ещё раз позже."
            }
            (ContextTrimmed, English) => "Context was trimmed.",
            (ContextTrimmed, Russian) => "Контекст был обрезан.",
            (NoAccess, English) => "You are not allowed to use this bot.",
            (NoAccess, Russian) => "У вас нет доступа к использованию данного бота.",
            (NoAccessToChat, English) => "You are not allowed to use this chat.",
            (NoAccessToChat, Russian) => "У вас нет доступа к этому чату.",
            (NoAccessToModel, English) => "You are not allowed to use this model.",
            (NoAccessToModel, Russian) => "У вас нет доступа к данной модели.",
            (Start, English) => "Welcome to AI bot! Use /new to create new chat.",
            (Start, Russian) => {
                "Добро пожаловать в AI бота! Воспользуйтесь командой /new для создания нового чата."
            }
            (Help, English) => "Use /new to create new chat.",
            (Help, Russian) => "Воспользуйтесь командой /new для создания нового чата.",
            (UnknownCommand, English) => "I don't know that command.",
            (UnknownCommand, Russian) => "Мне не известна данная команда.",
            (SelectModel, English) => "Select model to create new chat.",
            (SelectModel, Russian) => "Выберите модель, чтобы начать новый чат.",
            (SelectChat, English) => "Select chat to continue dialog.",
            (SelectChat, Russian) => "Выберите чат, чтобы продолжить общение в нём.",
            (FailedToGetChats, English) => "Failed to get all your chats.",
            (FailedToGetChats, Russian) => "Не удалось получить доступные вам чаты.",
            (NoChats, English) => "You dont have any chats.",
            (NoChats, Russian) => "У вас нет ни одного чата.",
            (TurnInProgress, English) => {
                "I'm still answering your previous message. Wait for it to finish."
            }
            (TurnInProgress, Russian) => {
                "Я ещё отвечаю на предыдущее сообщение. Дождитесь окончания ответа."
            }
        }
    }
}

pub fn started_chat(language: Language, model: &str) -> String {
    match language {
        Language::English => format!("Started new chat with {model} model."),
        Language::Russian => format!("Начат диалог с моделью {model}."),
    }
}

pub fn continued_chat(language: Language, model: &str) -> String {
    match language {
        Language::English => format!("Continue to chat with {model} model."),
        Language::Russian => format!("Диалог с моделью {model} продолжается."),
    }
}

pub fn chats_count(language: Language, count: usize) -> String {
    match language {
        Language::English => format!("Now you have {count} chats."),
        Language::Russian => format!("Количество доступных чатов: {count}."),
    }
}

/// One line of the `/chats` listing. `index` is 1-based.
pub fn chat_summary_line(
    language: Language,
    index: usize,
    messages: usize,
    model: &str,
    temperature: f32,
) -> String {
    match language {
        Language::English => {
            format!("\n{index}) Messages: {messages}, model: {model}, T: {temperature}")
        }
        Language::Russian => {
            format!("\n{index}) Сообщений: {messages}, модель: {model}, T: {temperature}")
        }
    }
}

/// Label of a `/select_chat` keyboard button.
pub fn chat_button_label(language: Language, model: &str, preview: &str, messages: usize) -> String {
    match language {
        Language::English => format!("{model} | \"{preview}\" | messages: {messages}"),
        Language::Russian => format!("{model} | \"{preview}\" | сообщений: {messages}"),
    }
}

/// Description shown in Telegram's command menu.
pub fn command_description(command: &str, language: Language) -> &'static str {
    match (command, language) {
        ("help", Language::English) => "Get help",
        ("help", Language::Russian) => "Подсказка",
        ("new", Language::English) => "Create new chat",
        ("new", Language::Russian) => "Создать новый чат",
        ("chats", Language::English) => "Show chats",
        ("chats", Language::Russian) => "Показать чаты",
        ("select_chat", Language::English) => "Select chat to continue",
        ("select_chat", Language::Russian) => "Выбрать чат для продолжения диалога",
        (_, Language::English) => "",
        (_, Language::Russian) => "",
    }
}
