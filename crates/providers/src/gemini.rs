//! Google Gemini native provider implementation.
//!
//! Uses the Generative Language API (`generateContent` /
//! `streamGenerateContent?alt=sse`).
//!
//! Features:
//! - `x-goog-api-key` header authentication
//! - `contents[].parts[]` request shape with `user` / `model` roles
//! - Generation settings under `generationConfig`
//! - Streaming via SSE; the stream ends when the connection closes

use std::time::Duration;

use async_trait::async_trait;
use chatminds_core::error::ProviderError;
use chatminds_core::message::{ChatMessage, Role};
use chatminds_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::http::{build_client, check_status, send_error};
use crate::sse::SseDecoder;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Marks instructions folded into a user turn.
pub const SYSTEM_PREFIX: &str = "SYSTEM: ";

/// Gemini native provider.
pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Create a new Gemini provider.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(api_key, DEFAULT_TIMEOUT)
    }

    /// Create with an explicit whole-request timeout.
    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            name: "gemini".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: build_client(timeout)?,
        })
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Translate the neutral list into Gemini `contents`.
    ///
    /// Gemini has no system role inside `contents`: system entries become
    /// user entries prefixed with [`SYSTEM_PREFIX`]. Entries that land on the
    /// same role back to back are merged into one content with several parts,
    /// keeping their order.
    pub(crate) fn to_api_contents(messages: &[ChatMessage]) -> Vec<GeminiContent> {
        let mut contents: Vec<GeminiContent> = Vec::new();

        for msg in messages {
            let (role, text) = match msg.role {
                Role::System => ("user", format!("{SYSTEM_PREFIX}{}", msg.content)),
                Role::User => ("user", msg.content.clone()),
                Role::Assistant => ("model", msg.content.clone()),
            };

            match contents.last_mut() {
                Some(last) if last.role == role => last.parts.push(GeminiPart { text }),
                _ => contents.push(GeminiContent {
                    role: role.into(),
                    parts: vec![GeminiPart { text }],
                }),
            }
        }

        contents
    }

    fn request_body(request: &ProviderRequest) -> GenerateRequest {
        GenerateRequest {
            contents: Self::to_api_contents(&request.messages),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }

    async fn post(&self, url: &str, body: &GenerateRequest) -> Result<reqwest::Response, ProviderError> {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(send_error)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, request.model);
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&url, &body).await?;
        let response = check_status(response, &self.name, &request.model).await?;

        let api_response: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(format!("Failed to parse response: {e}")))?;

        let text = api_response.text()?;

        Ok(ProviderResponse {
            message: ChatMessage::assistant(text),
            usage: api_response.usage_metadata.as_ref().map(UsageMetadata::to_usage),
            model: api_response.model_version.unwrap_or(request.model),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let body = Self::request_body(&request);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&url, &body).await?;
        let response = check_status(response, &self.name, &request.model).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut usage: Option<Usage> = None;

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
                    let event: GenerateResponse = match serde_json::from_str(data.trim()) {
                        Ok(event) => event,
                        Err(e) => {
                            trace!(
                                provider = %provider_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                            continue;
                        }
                    };

                    if let Some(meta) = &event.usage_metadata {
                        usage = Some(meta.to_usage());
                    }

                    if let Some(reason) = event.block_reason() {
                        let _ = tx
                            .send(Err(ProviderError::ApiError {
                                status_code: 200,
                                message: format!("Prompt blocked: {reason}"),
                            }))
                            .await;
                        return;
                    }

                    let fragment = event.fragment();
                    if !fragment.is_empty() {
                        let chunk = StreamChunk {
                            content: Some(fragment),
                            done: false,
                            usage: None,
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }

            if let Some(data) = decoder.finish()
                && let Ok(event) = serde_json::from_str::<GenerateResponse>(data.trim())
            {
                let fragment = event.fragment();
                if !fragment.is_empty() {
                    let _ = tx
                        .send(Ok(StreamChunk { content: Some(fragment), done: false, usage: None }))
                        .await;
                }
            }

            let _ = tx
                .send(Ok(StreamChunk { content: None, done: true, usage }))
                .await;
        });

        Ok(rx)
    }
}

// --- Gemini API types (internal) ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GeminiContent {
    #[serde(default)]
    pub(crate) role: String,
    #[serde(default)]
    pub(crate) parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GeminiPart {
    #[serde(default)]
    pub(crate) text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

impl GenerateResponse {
    /// Text of the first candidate, all parts joined.
    fn fragment(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }

    /// Full text of a one-shot response.
    fn text(&self) -> Result<String, ProviderError> {
        if let Some(reason) = self.block_reason() {
            return Err(ProviderError::ApiError {
                status_code: 200,
                message: format!("Prompt blocked: {reason}"),
            });
        }
        if self.candidates.is_empty() {
            return Err(ProviderError::MalformedResponse("No candidates in response".into()));
        }
        Ok(self.fragment())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl UsageMetadata {
    fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count,
            total_tokens: self.total_token_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(content: &GeminiContent) -> Vec<&str> {
        content.parts.iter().map(|p| p.text.as_str()).collect()
    }

    #[test]
    fn system_entries_fold_into_user_with_prefix() {
        let contents = GeminiProvider::to_api_contents(&[
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("Hello"),
        ]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].role, "user");
        assert_eq!(
            texts(&contents[0]),
            ["SYSTEM: You are a helpful assistant.", "Hello"]
        );
    }

    #[test]
    fn assistant_maps_to_model_and_roles_alternate() {
        let contents = GeminiProvider::to_api_contents(&[
            ChatMessage::system("directive"),
            ChatMessage::system("document excerpt"),
            ChatMessage::user("q1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q2"),
        ]);
        let roles: Vec<_> = contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, ["user", "model", "user"]);
        assert_eq!(
            texts(&contents[0]),
            ["SYSTEM: directive", "SYSTEM: document excerpt", "q1"]
        );
        assert_eq!(texts(&contents[1]), ["a1"]);
    }

    #[test]
    fn request_body_uses_camel_case_generation_config() {
        let request = ProviderRequest::new(
            "gemini-2.0-flash",
            vec![ChatMessage::user("hi")],
            GenerationParams::default(),
        );
        let json = serde_json::to_value(GeminiProvider::request_body(&request)).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1000);
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn parse_response_text_and_usage() {
        let data = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
            "modelVersion": "gemini-2.0-flash-001"
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.text().unwrap(), "Hello");
        let usage = parsed.usage_metadata.unwrap().to_usage();
        assert_eq!(usage.total_tokens, 6);
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let data = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let parsed: GenerateResponse = serde_json::from_str(data).unwrap();
        let err = parsed.text().unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn empty_candidates_is_malformed() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(parsed.text(), Err(ProviderError::MalformedResponse(_))));
    }
}
