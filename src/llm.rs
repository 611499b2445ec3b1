//! Streaming chat-completion providers.

pub mod openai;

pub use openai::OpenAiClient;

use crate::Message;
use crate::error::LlmError;

use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Incremental answer text, one item per provider chunk.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// A remote model that streams its answer.
pub trait CompletionProvider: Send + Sync + 'static {
    /// Start a completion. Errors before the first delta (network, auth,
    /// unknown model) are returned here; later failures arrive in the stream.
    fn stream_completion(
        &self,
        model: &str,
        temperature: f32,
        messages: &[Message],
    ) -> impl Future<Output = Result<DeltaStream, LlmError>> + Send;
}
