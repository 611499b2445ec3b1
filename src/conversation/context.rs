//! Builds the outbound prompt for one turn and trims it to the token budget.

use crate::conversation::tokens::SharedTokenCounter;
use crate::conversation::TokenCounter;
use crate::{Conversation, Message};

/// Drop the oldest messages until the estimate is under `budget`.
///
/// Returns the kept suffix and whether anything was removed. A counter
/// failure counts as over budget, so every iteration removes one message and
/// the loop ends after at most `history.len()` removals.
pub fn trim_to_budget(
    history: Vec<Message>,
    model: &str,
    budget: usize,
    counter: &dyn TokenCounter,
) -> (Vec<Message>, bool) {
    let mut start = 0;

    while start < history.len() {
        match counter.count(&history[start..], model) {
            Ok(tokens) if tokens < budget => break,
            Ok(tokens) => {
                tracing::debug!(model, tokens, budget, "context over budget, dropping oldest message");
            }
            Err(error) => {
                tracing::warn!(model, %error, "token counting failed, dropping oldest message");
            }
        }
        start += 1;
    }

    let trimmed = start > 0;
    if trimmed {
        tracing::info!(model, removed = start, kept = history.len() - start, "context trimmed");
    }

    let mut history = history;
    (history.split_off(start), trimmed)
}

/// Prompt for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub trimmed: bool,
}

/// Assembles prior turns plus the new user message, within budget.
#[derive(Clone)]
pub struct ContextBuilder {
    counter: SharedTokenCounter,
    budget: usize,
}

impl ContextBuilder {
    pub fn new(counter: SharedTokenCounter, budget: usize) -> Self {
        Self { counter, budget }
    }

    /// `chat` is left untouched. Persisting the user message is the caller's
    /// job.
    pub fn build(&self, chat: &Conversation, user_text: &str) -> BuiltContext {
        let mut history = chat.messages.clone();
        history.push(Message::user(user_text));

        let (messages, trimmed) =
            trim_to_budget(history, &chat.model, self.budget, self.counter.as_ref());

        BuiltContext { messages, trimmed }
    }
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 100 tokens per message.
    struct FlatCounter;

    impl TokenCounter for FlatCounter {
        fn count(&self, messages: &[Message], _model: &str) -> anyhow::Result<usize> {
            Ok(messages.len() * 100)
        }
    }

    /// Fails every call and records how many were made.
    #[derive(Default)]
    struct BrokenCounter {
        calls: AtomicUsize,
    }

    impl TokenCounter for BrokenCounter {
        fn count(&self, _messages: &[Message], _model: &str) -> anyhow::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("tokenizer unavailable")
        }
    }

    /// Fails the first call only.
    #[derive(Default)]
    struct FlakyCounter {
        calls: AtomicUsize,
    }

    impl TokenCounter for FlakyCounter {
        fn count(&self, messages: &[Message], _model: &str) -> anyhow::Result<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(messages.len())
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("message {i}"))).collect()
    }

    fn chat(messages: Vec<Message>) -> Conversation {
        Conversation {
            chat_id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            model: "gpt-test".into(),
            temperature: 1.0,
            messages,
        }
    }

    #[test]
    fn under_budget_is_untouched() {
        let (kept, trimmed) = trim_to_budget(history(3), "gpt-test", 301, &FlatCounter);
        assert_eq!(kept, history(3));
        assert!(!trimmed);
    }

    #[test]
    fn oldest_messages_go_first() {
        let (kept, trimmed) = trim_to_budget(history(5), "gpt-test", 350, &FlatCounter);
        assert!(trimmed);
        assert_eq!(kept, history(5)[2..].to_vec());
    }

    #[test]
    fn budget_is_exclusive() {
        let (kept, trimmed) = trim_to_budget(history(3), "gpt-test", 300, &FlatCounter);
        assert!(trimmed);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn failing_counter_still_terminates() {
        let counter = BrokenCounter::default();
        let (kept, trimmed) = trim_to_budget(history(4), "gpt-test", 10_000, &counter);

        assert!(kept.is_empty());
        assert!(trimmed);
        assert!(counter.calls.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn counter_failure_removes_one_message_and_retries() {
        let counter = FlakyCounter::default();
        let (kept, trimmed) = trim_to_budget(history(3), "gpt-test", 10, &counter);

        assert!(trimmed);
        assert_eq!(kept, history(3)[1..].to_vec());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_history_is_not_trimmed() {
        let (kept, trimmed) = trim_to_budget(Vec::new(), "gpt-test", 0, &FlatCounter);
        assert!(kept.is_empty());
        assert!(!trimmed);
    }

    #[test]
    fn builder_appends_user_text_and_reports_trim() {
        let builder = ContextBuilder::new(Arc::new(FlatCounter), 350);
        let chat = chat(history(4));

        let context = builder.build(&chat, "newest");

        assert!(context.trimmed);
        assert_eq!(context.messages.len(), 3);
        assert_eq!(context.messages[0], Message::user("message 2"));
        assert_eq!(context.messages.last(), Some(&Message::user("newest")));
        assert_eq!(chat.messages.len(), 4);
    }
}
