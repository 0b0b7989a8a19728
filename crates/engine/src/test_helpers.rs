//! Stub providers for orchestrator and surface tests.

use std::sync::Mutex;

use chatminds_core::error::ProviderError;
use chatminds_core::message::{ChatMessage, Role};
use chatminds_core::provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk};
use tokio::sync::mpsc;

fn text_response(text: impl Into<String>, model: &str) -> ProviderResponse {
    ProviderResponse {
        message: ChatMessage::assistant(text),
        usage: None,
        model: model.to_string(),
    }
}

fn last_user_text(request: &ProviderRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Spawn a task that sends `chunks` in order, then `tail` if given, then
/// keeps the sender open until the receiver goes away when `hold` is set.
fn spawn_chunks(chunks: Vec<String>, tail: Option<Result<StreamChunk, ProviderError>>, hold: bool) -> ChunkReceiver {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        for chunk in chunks {
            let item = StreamChunk {
                content: Some(chunk),
                ..Default::default()
            };
            if tx.send(Ok(item)).await.is_err() {
                return;
            }
        }
        if let Some(tail) = tail
            && tx.send(tail).await.is_err()
        {
            return;
        }
        if hold {
            tx.closed().await;
        }
    });
    rx
}

/// Replies `"echo: <last user text>"` and records every request.
#[derive(Default)]
pub struct EchoProvider {
    requests: Mutex<Vec<ProviderRequest>>,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let reply = format!("echo: {}", last_user_text(&request));
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        Ok(text_response(reply, &model))
    }
}

/// Streams fixed fragments; `complete` returns them joined.
pub struct ChunkedProvider {
    chunks: Vec<String>,
}

impl ChunkedProvider {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for ChunkedProvider {
    fn name(&self) -> &str {
        "chunked"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(text_response(self.chunks.concat(), &request.model))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let done = StreamChunk {
            done: true,
            ..Default::default()
        };
        Ok(spawn_chunks(self.chunks.clone(), Some(Ok(done)), false))
    }
}

/// Fails every call with the same error.
pub struct FailingProvider {
    error: ProviderError,
}

impl FailingProvider {
    pub fn new(error: ProviderError) -> Self {
        Self { error }
    }
}

#[async_trait::async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(self.error.clone())
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        Err(self.error.clone())
    }
}

/// Streams some fragments, then an error.
pub struct PartialStreamProvider {
    chunks: Vec<String>,
    error: ProviderError,
}

impl PartialStreamProvider {
    pub fn new(chunks: &[&str], error: ProviderError) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            error,
        }
    }
}

#[async_trait::async_trait]
impl Provider for PartialStreamProvider {
    fn name(&self) -> &str {
        "partial"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(self.error.clone())
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        Ok(spawn_chunks(self.chunks.clone(), Some(Err(self.error.clone())), false))
    }
}

/// Streams some fragments, then goes silent without closing.
pub struct StallingProvider {
    chunks: Vec<String>,
}

impl StallingProvider {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for StallingProvider {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Timeout("stalled".into()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        Ok(spawn_chunks(self.chunks.clone(), None, true))
    }
}
