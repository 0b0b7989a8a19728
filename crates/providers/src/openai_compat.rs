//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Usage reporting (`stream_options.include_usage`)

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use chatminds_core::error::ProviderError;
use chatminds_core::message::{ChatMessage, Role};
use chatminds_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::http::{build_client, check_status, send_error};
use crate::sse::SseDecoder;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// An OpenAI-compatible completion provider.
///
/// Roles map one to one onto the chat-completions schema.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_timeout(name, base_url, api_key, DEFAULT_TIMEOUT)
    }

    /// Create with an explicit whole-request timeout.
    pub fn with_timeout(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: build_client(timeout)?,
        })
    }

    /// Convert provider-neutral messages to OpenAI API format.
    fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                },
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        body
    }

    async fn post(&self, body: &serde_json::Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder.json(body).send().await.map_err(send_error)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&body, false).await?;
        let response = check_status(response, &self.name, &request.model).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("No choices in response".into()))?;

        let usage = api_response.usage.map(ApiUsage::into_usage);

        Ok(ProviderResponse {
            message: ChatMessage::assistant(choice.message.content.unwrap_or_default()),
            usage,
            model: api_response.model.unwrap_or(request.model),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&body, true).await?;
        let response = check_status(response, &self.name, &request.model).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks.
        // Returning drops `response`, which aborts the upstream call.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut state = StreamState::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in decoder.push(&bytes) {
                    if state.forward(&data, &tx, &provider_name).await.is_break() {
                        return;
                    }
                }
            }

            if let Some(data) = decoder.finish()
                && state.forward(&data, &tx, &provider_name).await.is_break()
            {
                return;
            }

            // Closed without [DONE]: complete only if the model said it was finished
            let last = if state.finished {
                Ok(StreamChunk { content: None, done: true, usage: state.usage })
            } else {
                Err(ProviderError::StreamInterrupted(
                    "connection closed before [DONE]".into(),
                ))
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What a stream has reported so far.
#[derive(Debug, Default)]
struct StreamState {
    usage: Option<Usage>,
    finished: bool,
}

impl StreamState {
    /// Handle one `data:` payload. Breaks once the stream is over or the
    /// receiver is gone.
    async fn forward(
        &mut self,
        data: &str,
        tx: &mpsc::Sender<std::result::Result<StreamChunk, ProviderError>>,
        provider_name: &str,
    ) -> ControlFlow<()> {
        let data = data.trim();

        // "[DONE]" signals end of stream
        if data == "[DONE]" {
            let _ = tx
                .send(Ok(StreamChunk { content: None, done: true, usage: self.usage }))
                .await;
            return ControlFlow::Break(());
        }

        let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
            Ok(stream_resp) => stream_resp,
            Err(e) => {
                trace!(
                    provider = %provider_name,
                    data = %data,
                    error = %e,
                    "Ignoring unparseable SSE chunk"
                );
                return ControlFlow::Continue(());
            }
        };

        if let Some(u) = stream_resp.usage {
            self.usage = Some(u.into_usage());
        }

        let Some(choice) = stream_resp.choices.into_iter().next() else {
            return ControlFlow::Continue(());
        };
        if choice.finish_reason.is_some() {
            self.finished = true;
        }

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            let chunk = StreamChunk {
                content: Some(content),
                done: false,
                usage: None,
            };
            if tx.send(Ok(chunk)).await.is_err() {
                return ControlFlow::Break(()); // receiver dropped
            }
        }
        ControlFlow::Continue(())
    }
}
