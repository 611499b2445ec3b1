//! Completion producer: provider deltas in, cumulative snapshots out.

use crate::Message;
use crate::error::LlmError;
use crate::llm::CompletionProvider;

use futures::StreamExt as _;
use tokio::sync::mpsc;

/// Stream a completion and send the answer-so-far after every non-empty
/// delta. Each snapshot extends the previous one.
///
/// The channel closes when this returns, on success or failure. A failure to
/// start the stream returns before any snapshot is sent.
pub async fn produce<P: CompletionProvider>(
    provider: &P,
    model: &str,
    temperature: f32,
    messages: &[Message],
    snapshots: mpsc::UnboundedSender<String>,
) -> Result<(), LlmError> {
    let mut deltas = provider
        .stream_completion(model, temperature, messages)
        .await?;

    let mut answer = String::new();
    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        if delta.is_empty() {
            continue;
        }

        answer.push_str(&delta);
        if snapshots.send(answer.clone()).is_err() {
            tracing::debug!(model, "snapshot receiver dropped, stopping producer");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ScriptedProvider;

    async fn run(provider: &ScriptedProvider) -> (Result<(), LlmError>, Vec<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = produce(provider, "gpt-test", 1.0, &[Message::user("Hello")], tx).await;

        let mut snapshots = Vec::new();
        while let Some(snapshot) = rx.recv().await {
            snapshots.push(snapshot);
        }
        (result, snapshots)
    }

    #[tokio::test]
    async fn snapshots_are_cumulative() {
        let (result, snapshots) = run(&ScriptedProvider::new(&["Hi", " there", "!"])).await;

        result.unwrap();
        assert_eq!(snapshots, vec!["Hi", "Hi there", "Hi there!"]);
        for pair in snapshots.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
    }

    #[tokio::test]
    async fn empty_deltas_emit_nothing() {
        let (result, snapshots) = run(&ScriptedProvider::new(&["", "a", "", "b", ""])).await;

        result.unwrap();
        assert_eq!(snapshots, vec!["a", "ab"]);
    }

    #[tokio::test]
    async fn start_failure_emits_nothing() {
        let provider = ScriptedProvider {
            deltas: vec!["never"],
            fail_start: true,
            ..ScriptedProvider::default()
        };
        let (result, snapshots) = run(&provider).await;

        assert!(matches!(result, Err(LlmError::Request(_))));
        assert!(snapshots.is_empty());
    }

    #[tokio::test]
    async fn stream_error_keeps_earlier_snapshots_only() {
        let provider = ScriptedProvider {
            deltas: vec!["a", "b", "c"],
            fail_after: Some(1),
            ..ScriptedProvider::default()
        };
        let (result, snapshots) = run(&provider).await;

        assert!(matches!(result, Err(LlmError::Stream(_))));
        assert_eq!(snapshots, vec!["a"]);
    }
}
