//! Token counting for chat-completion prompts.

use crate::Message;

use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tiktoken_rs::CoreBPE;

/// Framing tokens around every message.
const TOKENS_PER_MESSAGE: usize = 3;

/// Tokens priming the assistant reply.
const REPLY_PRIMING_TOKENS: usize = 3;

/// Estimates the prompt size of a message list for a given model.
pub trait TokenCounter: Send + Sync {
    fn count(&self, messages: &[Message], model: &str) -> anyhow::Result<usize>;
}

/// Shared, dynamically dispatched counter.
pub type SharedTokenCounter = Arc<dyn TokenCounter>;

/// tiktoken-based counter following OpenAI's chat token accounting.
///
/// Encoders are cached per model id. Loading one is slow, so callers should
/// [`preload`](Self::preload) known models off the async runtime; anything
/// else is loaded on first use. Model ids tiktoken does not know fall back to
/// `cl100k_base`.
#[derive(Default)]
pub struct TiktokenCounter {
    encoders: Mutex<HashMap<String, Arc<CoreBPE>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and cache the encoders for `models`. Blocking.
    pub fn preload<'a>(&self, models: impl IntoIterator<Item = &'a str>) -> anyhow::Result<()> {
        for model in models {
            self.encoder(model)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_cached(&self, model: &str) -> bool {
        self.encoders
            .lock()
            .is_ok_and(|encoders| encoders.contains_key(model))
    }

    fn encoder(&self, model: &str) -> anyhow::Result<Arc<CoreBPE>> {
        let mut encoders = self
            .encoders
            .lock()
            .map_err(|_| anyhow::anyhow!("token encoder cache poisoned"))?;

        if let Some(encoder) = encoders.get(model) {
            return Ok(encoder.clone());
        }

        let encoder = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(encoder) => encoder,
            Err(_) => {
                tracing::debug!(model, "no tokenizer for model, using cl100k_base");
                tiktoken_rs::cl100k_base().context("failed to load cl100k_base tokenizer")?
            }
        };

        let encoder = Arc::new(encoder);
        encoders.insert(model.to_string(), encoder.clone());
        Ok(encoder)
    }
}

impl std::fmt::Debug for TiktokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenCounter").finish_non_exhaustive()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, messages: &[Message], model: &str) -> anyhow::Result<usize> {
        let encoder = self.encoder(model)?;

        let total = messages.iter().fold(REPLY_PRIMING_TOKENS, |total, message| {
            total
                + TOKENS_PER_MESSAGE
                + encoder.encode_with_special_tokens(message.source.as_str()).len()
                + encoder.encode_with_special_tokens(&message.body).len()
        });

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_costs_only_priming() {
        let counter = TiktokenCounter::new();
        assert_eq!(counter.count(&[], "gpt-4o").unwrap(), REPLY_PRIMING_TOKENS);
    }

    #[test]
    fn longer_bodies_cost_more() {
        let counter = TiktokenCounter::new();
        let short = counter.count(&[Message::user("hi")], "gpt-4").unwrap();
        let long = counter
            .count(&[Message::user("hi ".repeat(200))], "gpt-4")
            .unwrap();

        assert!(short > REPLY_PRIMING_TOKENS + TOKENS_PER_MESSAGE);
        assert!(long > short + 100);
    }

    #[test]
    fn preload_fills_the_cache() {
        let counter = TiktokenCounter::new();
        assert!(!counter.is_cached("gpt-4o"));

        counter.preload(["gpt-4o", "local-llama"]).unwrap();

        assert!(counter.is_cached("gpt-4o"));
        assert!(counter.is_cached("local-llama"));
        assert!(!counter.is_cached("gpt-4"));
    }

    #[test]
    fn unknown_models_fall_back_to_cl100k() {
        let counter = TiktokenCounter::new();
        let messages = [Message::user("hello there"), Message::assistant("hi")];

        let unknown = counter.count(&messages, "definitely-not-a-model").unwrap();
        let gpt4 = counter.count(&messages, "gpt-4").unwrap();
        assert_eq!(unknown, gpt4);
    }
}
