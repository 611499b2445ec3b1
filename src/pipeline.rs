//! Streaming answer delivery.
//!
//! One user turn runs three stages concurrently, connected by unbounded
//! channels:
//!
//! ```text
//! provider deltas -> producer -> snapshots -> throttle -> dispatch -> platform + storage
//! ```
//!
//! The producer emits the cumulative answer after every delta. The throttle
//! passes at most one snapshot per window and always flushes the last one.
//! Dispatch turns the throttled snapshots into one message create followed by
//! edits, and persists the final answer once the stream ends.

pub mod dispatch;
pub mod producer;
pub mod throttle;

use crate::conversation::ContextBuilder;
use crate::error::TurnError;
use crate::llm::CompletionProvider;
use crate::storage::Storage;
use crate::{Conversation, MessageSource, PlatformMessageId};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a turn's answer is shown to the user.
pub trait AnswerSink: Send + Sync {
    /// Post the first version of the answer. Returns the id later edits target.
    fn create(&self, text: &str) -> impl Future<Output = anyhow::Result<PlatformMessageId>> + Send;

    /// Replace the posted answer with a longer version.
    fn edit(
        &self,
        message_id: PlatformMessageId,
        text: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Show that an answer is being prepared.
    fn typing(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Older history was dropped to fit the token budget.
    pub trimmed: bool,
    /// The answer as shown to the user and persisted, or `None` if nothing
    /// was delivered.
    pub answer: Option<String>,
}

/// Runs user turns against one provider and store.
pub struct ConversationPipeline<S, P> {
    storage: Arc<S>,
    provider: Arc<P>,
    context: ContextBuilder,
    throttle_window: Duration,
}

impl<S, P> Clone for ConversationPipeline<S, P> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            provider: self.provider.clone(),
            context: self.context.clone(),
            throttle_window: self.throttle_window,
        }
    }
}

impl<S: Storage, P: CompletionProvider> ConversationPipeline<S, P> {
    pub fn new(
        storage: Arc<S>,
        provider: Arc<P>,
        context: ContextBuilder,
        throttle_window: Duration,
    ) -> Self {
        Self {
            storage,
            provider,
            context,
            throttle_window,
        }
    }

    /// Run one turn: persist `text`, stream the answer into `sink`, persist
    /// the answer.
    ///
    /// The user message stays persisted even if the completion fails. A
    /// provider error is returned only after throttle and dispatch have
    /// drained whatever arrived before it.
    pub async fn run_turn(
        &self,
        chat: &Conversation,
        text: &str,
        sink: &impl AnswerSink,
    ) -> Result<TurnOutcome, TurnError> {
        self.storage
            .append_message(chat.chat_id, text, MessageSource::User)
            .await
            .map_err(TurnError::SaveUserMessage)?;

        let context = self.context.build(chat, text);

        if let Err(error) = sink.typing().await {
            tracing::debug!(chat_id = %chat.chat_id, %error, "failed to send typing indicator");
        }

        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (throttled_tx, throttled_rx) = mpsc::unbounded_channel();

        let (produced, (), dispatched) = tokio::join!(
            producer::produce(
                self.provider.as_ref(),
                &chat.model,
                chat.temperature,
                &context.messages,
                snapshot_tx,
            ),
            throttle::throttle(snapshot_rx, throttled_tx, self.throttle_window),
            dispatch::dispatch(throttled_rx, sink, self.storage.as_ref(), chat.chat_id),
        );

        if let Err(error) = produced {
            tracing::warn!(chat_id = %chat.chat_id, %error, "completion failed");
            return Err(TurnError::Completion(error));
        }
        let answer = dispatched.map_err(TurnError::SaveAnswer)?;

        tracing::info!(
            chat_id = %chat.chat_id,
            trimmed = context.trimmed,
            answer_len = answer.as_ref().map_or(0, String::len),
            "turn completed"
        );

        Ok(TurnOutcome {
            trimmed: context.trimmed,
            answer,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, ScriptedProvider, SinkCall};
    use super::*;
    use crate::Message;
    use crate::conversation::TokenCounter;
    use crate::error::LlmError;
    use crate::storage::MemoryStorage;

    struct MessageCounter;

    impl TokenCounter for MessageCounter {
        fn count(&self, messages: &[Message], _model: &str) -> anyhow::Result<usize> {
            Ok(messages.len())
        }
    }

    async fn setup(
        provider: ScriptedProvider,
        budget: usize,
    ) -> (
        ConversationPipeline<MemoryStorage, ScriptedProvider>,
        Arc<MemoryStorage>,
        Arc<ScriptedProvider>,
        Conversation,
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let provider = Arc::new(provider);
        let user_id = storage.create_user(1, &[]).await.unwrap();
        let chat = storage.create_chat(user_id, "gpt-test", 1.0).await.unwrap();
        let pipeline = ConversationPipeline::new(
            storage.clone(),
            provider.clone(),
            ContextBuilder::new(Arc::new(MessageCounter), budget),
            Duration::ZERO,
        );
        (pipeline, storage, provider, chat)
    }

    #[tokio::test]
    async fn hello_turn_creates_then_edits_and_persists_once() {
        let (pipeline, storage, _provider, chat) =
            setup(ScriptedProvider::new(&["Hi", " there", "!"]), 100).await;
        let sink = RecordingSink::default();

        let outcome = pipeline.run_turn(&chat, "Hello", &sink).await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome {
                trimmed: false,
                answer: Some("Hi there!".into())
            }
        );
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Create("Hi".into()),
                SinkCall::Edit(77, "Hi there".into()),
                SinkCall::Edit(77, "Hi there!".into()),
            ]
        );
        let stored = storage.get_chat(chat.chat_id).await.unwrap();
        assert_eq!(
            stored.messages,
            vec![Message::user("Hello"), Message::assistant("Hi there!")]
        );
    }

    #[tokio::test]
    async fn start_failure_keeps_user_message_and_sends_nothing() {
        let provider = ScriptedProvider {
            fail_start: true,
            ..ScriptedProvider::default()
        };
        let (pipeline, storage, _provider, chat) = setup(provider, 100).await;
        let sink = RecordingSink::default();

        let error = pipeline.run_turn(&chat, "Hello", &sink).await.unwrap_err();

        assert!(matches!(error, TurnError::Completion(LlmError::Request(_))));
        assert!(sink.calls().is_empty());
        let stored = storage.get_chat(chat.chat_id).await.unwrap();
        assert_eq!(stored.messages, vec![Message::user("Hello")]);
    }

    #[tokio::test]
    async fn midstream_failure_is_surfaced_after_draining() {
        let provider = ScriptedProvider {
            deltas: vec!["Hi", " there", "!"],
            fail_after: Some(2),
            ..ScriptedProvider::default()
        };
        let (pipeline, storage, _provider, chat) = setup(provider, 100).await;
        let sink = RecordingSink::default();

        let error = pipeline.run_turn(&chat, "Hello", &sink).await.unwrap_err();

        assert!(matches!(error, TurnError::Completion(LlmError::Stream(_))));
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Create("Hi".into()),
                SinkCall::Edit(77, "Hi there".into()),
            ]
        );
        let stored = storage.get_chat(chat.chat_id).await.unwrap();
        assert_eq!(stored.messages.last(), Some(&Message::assistant("Hi there")));
    }

    #[tokio::test]
    async fn missing_chat_fails_before_streaming() {
        let (pipeline, _storage, provider, mut chat) =
            setup(ScriptedProvider::new(&["Hi"]), 100).await;
        chat.chat_id = uuid::Uuid::new_v4();
        let sink = RecordingSink::default();

        let error = pipeline.run_turn(&chat, "Hello", &sink).await.unwrap_err();

        assert!(matches!(error, TurnError::SaveUserMessage(_)));
        assert!(provider.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undelivered_answer_is_not_reported_or_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let user_id = storage.create_user(1, &[]).await.unwrap();
        let chat = storage.create_chat(user_id, "gpt-test", 1.0).await.unwrap();
        let pipeline = ConversationPipeline::new(
            storage.clone(),
            Arc::new(ScriptedProvider::new(&["Hi", " there", "!"])),
            ContextBuilder::new(Arc::new(MessageCounter), 100),
            Duration::from_secs(60),
        );
        let sink = RecordingSink {
            failing_creates: 1.into(),
            ..RecordingSink::default()
        };

        let outcome = pipeline.run_turn(&chat, "Hello", &sink).await.unwrap();

        assert_eq!(outcome.answer, None);
        assert!(sink.calls().is_empty());
        let stored = storage.get_chat(chat.chat_id).await.unwrap();
        assert_eq!(stored.messages, vec![Message::user("Hello")]);
    }

    #[tokio::test]
    async fn long_history_is_trimmed_for_the_request_only() {
        let (pipeline, storage, provider, chat) =
            setup(ScriptedProvider::new(&["ok"]), 3).await;
        for body in ["one", "two", "three"] {
            storage
                .append_message(chat.chat_id, body, MessageSource::User)
                .await
                .unwrap();
        }
        let chat = storage.get_chat(chat.chat_id).await.unwrap();

        let outcome = pipeline
            .run_turn(&chat, "four", &RecordingSink::default())
            .await
            .unwrap();

        assert!(outcome.trimmed);
        let requests = provider.requests.lock().unwrap();
        assert_eq!(
            requests[0],
            vec![Message::user("three"), Message::user("four")]
        );
        assert_eq!(storage.get_chat(chat.chat_id).await.unwrap().messages.len(), 5);
    }
}
