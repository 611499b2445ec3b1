//! OpenAI-compatible `/chat/completions` client over server-sent events.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};
use crate::llm::{CompletionProvider, DeltaStream};
use crate::Message;

use anyhow::Context as _;
use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    top_p: f32,
    n: u32,
    stream: bool,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Streaming client for OpenAI and API-compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .read_timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

impl CompletionProvider for OpenAiClient {
    async fn stream_completion(
        &self,
        model: &str,
        temperature: f32,
        messages: &[Message],
    ) -> std::result::Result<DeltaStream, LlmError> {
        let request = ChatCompletionRequest {
            model,
            temperature,
            top_p: 1.0,
            n: 1,
            stream: true,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: message.source.as_str(),
                    content: &message.body,
                })
                .collect(),
        };

        tracing::debug!(model, messages = messages.len(), "starting completion stream");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|error| LlmError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ApiErrorEnvelope>(&body) {
                Ok(envelope) => envelope.error.message,
                Err(_) if body.trim().is_empty() => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
                Err(_) => body,
            };
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Box::pin(delta_stream(response.bytes_stream())))
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<std::result::Result<String, LlmError>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into content deltas. Ends at `[DONE]`, at the
/// end of the body, or after the first error.
fn delta_stream<S, B, E>(bytes: S) -> impl Stream<Item = std::result::Result<String, LlmError>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    drain_events(&mut state);
                }
                Some(Err(error)) => {
                    state.finished = true;
                    state.pending.push_back(Err(LlmError::Stream(error.to_string())));
                }
                None => {
                    // A final event may lack its blank-line terminator.
                    if !state.buffer.is_empty() {
                        state.buffer.extend_from_slice(b"\n\n");
                        drain_events(&mut state);
                    }
                    state.finished = true;
                }
            }
        }
    })
}

fn drain_events<S>(state: &mut SseState<S>) {
    while let Some(data) = extract_sse_data(&mut state.buffer) {
        if data.trim() == "[DONE]" {
            state.finished = true;
            return;
        }

        match serde_json::from_str::<ChatCompletionChunk>(&data) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    state.pending.push_back(Err(LlmError::Stream(error.message)));
                    state.finished = true;
                    return;
                }
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content);
                if let Some(content) = content {
                    state.pending.push_back(Ok(content));
                }
            }
            Err(error) => {
                tracing::warn!(%error, data = %data, "malformed completion chunk");
                state
                    .pending
                    .push_back(Err(LlmError::Stream(format!("malformed chunk: {error}"))));
                state.finished = true;
                return;
            }
        }
    }
}

/// Pop the next complete event off `buffer` and return its joined `data:`
/// lines. Events without data (comments, keep-alives) are skipped.
fn extract_sse_data(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let (end, separator) = find_event_end(buffer)?;
        let raw: Vec<u8> = buffer.drain(..end + separator).collect();
        let block = String::from_utf8_lossy(&raw[..end]);

        let data: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();

        if data.is_empty() {
            continue;
        }

        return Some(data.join("\n"));
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}
