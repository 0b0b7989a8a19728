//! The conversation orchestrator.
//!
//! One turn walks `Idle → UserPersisted → Generating → {AssistantPersisted | Failed}`.
//! There is no rollback: once the user turn is durable it stays, whatever
//! the backend does afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatminds_config::{AppConfig, PromptsConfig};
use chatminds_core::error::{Error, ProviderError, Result, ValidationError};
use chatminds_core::message::{DocumentId, OwnerId, Role, ThreadKey};
use chatminds_core::provider::{GenerationParams, Provider, ProviderRequest, Usage};
use chatminds_core::store::Store;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::context::{AssemblyInput, AssemblyMetadata, ContextAssembler, ContextBudget};
use crate::stream_event::TurnEvent;

/// Capacity of the event channel returned by [`Orchestrator::spawn_stream`].
const EVENT_BUFFER: usize = 64;

/// The two system directives, one per turn kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directives {
    pub general: String,
    pub document: String,
}

impl From<&PromptsConfig> for Directives {
    fn from(prompts: &PromptsConfig) -> Self {
        Self {
            general: prompts.general.clone(),
            document: prompts.document.clone(),
        }
    }
}

impl Default for Directives {
    fn default() -> Self {
        Self::from(&PromptsConfig::default())
    }
}

/// One inbound turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub owner: OwnerId,
    pub key: ThreadKey,
    pub text: String,
    /// Replaces the configured directive for this turn only.
    pub directive: Option<String>,
}

impl TurnRequest {
    pub fn conversation(owner: OwnerId, conversation_id: &str, text: impl Into<String>) -> Self {
        Self {
            owner,
            key: ThreadKey::conversation(conversation_id),
            text: text.into(),
            directive: None,
        }
    }

    pub fn document(owner: OwnerId, document_id: &str, text: impl Into<String>) -> Self {
        Self {
            owner,
            key: ThreadKey::document(document_id),
            text: text.into(),
            directive: None,
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub key: ThreadKey,
    pub user_sequence: i64,
    pub assistant_sequence: i64,
    pub text: String,
    pub usage: Option<Usage>,
    pub context: AssemblyMetadata,
}

/// State after the user turn is durable and the request is built.
struct PreparedTurn {
    user_sequence: i64,
    request: ProviderRequest,
    context: AssemblyMetadata,
}

/// How a provider stream ended.
enum StreamEnd {
    Finished,
    /// The event receiver went away.
    Cancelled,
    Failed(ProviderError),
}

/// Runs turns against a store and a completion backend.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    assembler: ContextAssembler,
    model: String,
    params: GenerationParams,
    directives: Directives,
    locks: KeyLocks,
    serialize_turns: bool,
    stream_idle_timeout: Duration,
}

impl Orchestrator {
    /// Create an orchestrator with default budget, directives and timeouts.
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            store,
            provider,
            assembler: ContextAssembler::default(),
            model: model.into(),
            params: GenerationParams::default(),
            directives: Directives::default(),
            locks: KeyLocks::default(),
            serialize_turns: true,
            stream_idle_timeout: Duration::from_secs(60),
        }
    }

    /// Create an orchestrator with everything taken from configuration.
    pub fn from_config(config: &AppConfig, store: Arc<dyn Store>, provider: Arc<dyn Provider>) -> Self {
        Self::new(store, provider, config.model.clone())
            .with_params(GenerationParams {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            })
            .with_budget(ContextBudget::from_limits(
                config.context.document_char_budget,
                config.context.history_token_budget,
            ))
            .with_directives(Directives::from(&config.prompts))
            .with_serialize_turns(config.engine.serialize_turns)
            .with_stream_idle_timeout(Duration::from_secs(config.engine.stream_idle_timeout_secs))
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.assembler = ContextAssembler::new(budget);
        self
    }

    pub fn with_directives(mut self, directives: Directives) -> Self {
        self.directives = directives;
        self
    }

    /// Enable or disable per-key turn serialization.
    pub fn with_serialize_turns(mut self, enabled: bool) -> Self {
        self.serialize_turns = enabled;
        self
    }

    /// Longest wait for the next stream fragment.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run a one-shot turn.
    ///
    /// A backend failure leaves the user turn persisted and writes no
    /// assistant turn.
    pub async fn turn(&self, req: TurnRequest) -> Result<TurnOutcome> {
        let _guard = self.acquire(&req).await;
        let prepared = self.prepare(&req).await?;

        debug!(model = %self.model, provider = self.provider.name(), "Dispatching completion");
        let response = match self.provider.complete(prepared.request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(owner = %req.owner, key = %req.key, error = %e, "Generation failed");
                return Err(e.into());
            }
        };

        let text = response.message.content;
        let assistant_sequence = self
            .store
            .append(&req.owner, &req.key, Role::Assistant, &text)
            .await?;

        info!(
            owner = %req.owner,
            key = %req.key,
            sequence = assistant_sequence,
            total_tokens = response.usage.map(|u| u.total_tokens),
            "Assistant turn persisted"
        );

        Ok(TurnOutcome {
            key: req.key,
            user_sequence: prepared.user_sequence,
            assistant_sequence,
            text,
            usage: response.usage,
            context: prepared.context,
        })
    }

    /// Run a streaming turn, forwarding each fragment to `events` as a
    /// [`TurnEvent::Chunk`] before the assistant turn is persisted.
    ///
    /// No terminal event is sent here; see [`Orchestrator::spawn_stream`].
    /// When the stream fails or `events` is closed mid-way, the text received
    /// so far is persisted before the error is returned.
    pub async fn turn_streaming(&self, req: TurnRequest, events: &mpsc::Sender<TurnEvent>) -> Result<TurnOutcome> {
        let _guard = self.acquire(&req).await;
        let mut prepared = self.prepare(&req).await?;
        prepared.request.stream = true;

        debug!(model = %self.model, provider = self.provider.name(), "Dispatching streaming completion");
        let mut chunks = match self.provider.stream(prepared.request).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(owner = %req.owner, key = %req.key, error = %e, "Stream could not start");
                return Err(e.into());
            }
        };

        let mut text = String::new();
        let mut usage = None;
        let end = loop {
            let next = match tokio::time::timeout(self.stream_idle_timeout, chunks.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    break StreamEnd::Failed(ProviderError::Timeout(format!(
                        "no stream fragment within {}s",
                        self.stream_idle_timeout.as_secs()
                    )));
                }
            };

            let chunk = match next {
                None => break StreamEnd::Finished,
                Some(Err(e)) => break StreamEnd::Failed(e),
                Some(Ok(chunk)) => chunk,
            };

            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if let Some(fragment) = chunk.content
                && !fragment.is_empty()
            {
                text.push_str(&fragment);
                if events.send(TurnEvent::chunk(fragment)).await.is_err() {
                    break StreamEnd::Cancelled;
                }
            }
            if chunk.done {
                break StreamEnd::Finished;
            }
        };
        // Dropping the receiver stops the provider's reader task.
        drop(chunks);

        let failure = match end {
            StreamEnd::Finished => None,
            StreamEnd::Cancelled => {
                info!(owner = %req.owner, key = %req.key, chars = text.len(), "Stream receiver dropped");
                Some(ProviderError::StreamInterrupted("client disconnected".into()))
            }
            StreamEnd::Failed(e) => {
                warn!(owner = %req.owner, key = %req.key, error = %e, "Stream failed");
                Some(e)
            }
        };

        if let Some(error) = failure {
            if !text.is_empty() {
                match self.store.append(&req.owner, &req.key, Role::Assistant, &text).await {
                    Ok(sequence) => {
                        info!(owner = %req.owner, key = %req.key, sequence, "Partial assistant turn persisted");
                    }
                    Err(e) => {
                        warn!(owner = %req.owner, key = %req.key, error = %e, "Could not persist partial assistant turn");
                    }
                }
            }
            return Err(error.into());
        }

        let assistant_sequence = self
            .store
            .append(&req.owner, &req.key, Role::Assistant, &text)
            .await?;

        info!(
            owner = %req.owner,
            key = %req.key,
            sequence = assistant_sequence,
            total_tokens = usage.map(|u| u.total_tokens),
            "Assistant turn persisted"
        );

        Ok(TurnOutcome {
            key: req.key,
            user_sequence: prepared.user_sequence,
            assistant_sequence,
            text,
            usage,
            context: prepared.context,
        })
    }

    /// Run a streaming turn on a background task.
    ///
    /// The receiver yields zero or more `Chunk` events followed by exactly
    /// one `Done` or `Error`. Dropping it cancels the turn.
    pub fn spawn_stream(self: &Arc<Self>, req: TurnRequest) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let terminal = match this.turn_streaming(req, &tx).await {
                Ok(outcome) => TurnEvent::done(outcome.key.id(), outcome.usage),
                Err(e) => TurnEvent::error(e.to_string()),
            };
            let _ = tx.send(terminal).await;
        });
        rx
    }

    /// Validate, persist the user turn, then assemble the request.
    async fn prepare(&self, req: &TurnRequest) -> Result<PreparedTurn> {
        if req.text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        req.key.validate()?;

        let document = match &req.key {
            ThreadKey::Conversation(_) => None,
            ThreadKey::Document(id) => Some(self.lookup_document(&req.owner, id).await?),
        };

        let directive = match (&req.directive, document.is_some()) {
            (Some(custom), _) => custom.as_str(),
            (None, true) => self.directives.document.as_str(),
            (None, false) => self.directives.general.as_str(),
        };

        let user_sequence = self.store.append(&req.owner, &req.key, Role::User, &req.text).await?;
        info!(owner = %req.owner, key = %req.key, sequence = user_sequence, "User turn persisted");

        let mut history = self.store.read(&req.owner, &req.key).await?;
        history.retain(|m| m.sequence < user_sequence);

        let assembled = self.assembler.assemble(&AssemblyInput {
            directive,
            document: document.as_deref(),
            history: &history,
            user_text: &req.text,
        });
        debug!(
            history_included = assembled.metadata.history_included,
            history_dropped = assembled.metadata.history_dropped,
            document_chars = assembled.metadata.document_chars,
            document_truncated = assembled.metadata.document_truncated,
            estimated_tokens = assembled.metadata.estimated_tokens,
            "Context assembled"
        );

        Ok(PreparedTurn {
            user_sequence,
            request: ProviderRequest::new(self.model.clone(), assembled.messages, self.params),
            context: assembled.metadata,
        })
    }

    async fn lookup_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<String> {
        match self.store.get_document(owner, id).await? {
            Some(record) => Ok(record.text),
            None => Err(Error::Validation(ValidationError::DocumentNotFound(id.to_string()))),
        }
    }

    async fn acquire(&self, req: &TurnRequest) -> Option<KeyGuard> {
        if !self.serialize_turns {
            return None;
        }
        Some(self.locks.acquire(req.owner.clone(), req.key.clone()).await)
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

type LockMap = HashMap<(OwnerId, ThreadKey), Arc<tokio::sync::Mutex<()>>>;

/// Per-(owner, key) async mutexes, created on demand and pruned once unused.
#[derive(Default)]
struct KeyLocks {
    map: Arc<Mutex<LockMap>>,
}

impl KeyLocks {
    async fn acquire(&self, owner: OwnerId, key: ThreadKey) -> KeyGuard {
        let slot = (owner, key);
        let lock = {
            let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(slot.clone()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        KeyGuard {
            guard: Some(guard),
            lock,
            slot: Some(slot),
            map: Arc::clone(&self.map),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Holds a key's turn lock; removes the map entry on drop when nobody else waits.
struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<tokio::sync::Mutex<()>>,
    slot: Option<(OwnerId, ThreadKey)>,
    map: Arc<Mutex<LockMap>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2
            && let Some(slot) = self.slot.take()
        {
            map.remove(&slot);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ChunkedProvider, EchoProvider, FailingProvider, PartialStreamProvider, StallingProvider,
    };
    use chatminds_core::document::NewDocument;
    use chatminds_core::message::Message;
    use async_trait::async_trait;
    use chatminds_core::document::DocumentRecord;
    use chatminds_core::error::StoreError;
    use chatminds_core::message::ConversationSummary;
    use chatminds_core::store::{DocumentStore, MessageStore, OwnerStore};
    use chatminds_store::InMemoryStore;

    fn owner() -> OwnerId {
        OwnerId::from("U1")
    }

    fn orchestrator(store: &InMemoryStore, provider: impl Provider + 'static) -> Orchestrator {
        Orchestrator::new(Arc::new(store.clone()), Arc::new(provider), "stub-model")
    }

    fn roles_and_text(messages: &[Message]) -> Vec<(Role, &str)> {
        messages.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn hello_scenario_persists_user_then_echo() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, EchoProvider::new());

        let req = TurnRequest::conversation(owner(), "C1", "Hello").with_directive("You are a helpful assistant.");
        let outcome = orch.turn(req).await.unwrap();
        assert_eq!(outcome.text, "echo: Hello");
        assert_eq!(outcome.user_sequence, 1);
        assert_eq!(outcome.assistant_sequence, 2);

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(
            roles_and_text(&stored),
            vec![(Role::User, "Hello"), (Role::Assistant, "echo: Hello")]
        );
    }

    #[tokio::test]
    async fn n_turns_store_two_n_messages_in_order() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, EchoProvider::new());

        for i in 0..5 {
            let req = TurnRequest::conversation(owner(), "C1", format!("turn {i}"));
            orch.turn(req).await.unwrap();
        }

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(stored.len(), 10);
        let sequences: Vec<_> = stored.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
        for pair in stored.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[1].content, format!("echo: {}", pair[0].content));
        }
    }

    #[tokio::test]
    async fn history_excludes_the_new_user_turn() {
        let store = InMemoryStore::new();
        let provider = Arc::new(EchoProvider::new());
        let orch = Orchestrator::new(Arc::new(store.clone()), provider.clone(), "stub-model");

        orch.turn(TurnRequest::conversation(owner(), "C1", "first")).await.unwrap();
        orch.turn(TurnRequest::conversation(owner(), "C1", "second")).await.unwrap();

        let requests = provider.requests();
        let last = &requests[1].messages;
        let contents: Vec<_> = last.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            ["You are a helpful assistant.", "first", "echo: first", "second"]
        );
        assert_eq!(requests[1].model, "stub-model");
        assert_eq!(requests[1].max_tokens, Some(1000));
    }

    #[tokio::test]
    async fn backend_failure_keeps_user_turn_only() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, FailingProvider::new(ProviderError::Network("down".into())));

        let err = orch
            .turn(TurnRequest::conversation(owner(), "C1", "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(ProviderError::Network(_))));

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(roles_and_text(&stored), vec![(Role::User, "Hello")]);
    }

    #[tokio::test]
    async fn empty_text_rejected_before_persistence() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, EchoProvider::new());

        let err = orch
            .turn(TurnRequest::conversation(owner(), "C1", "   "))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_key_rejected_before_persistence() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, EchoProvider::new());

        let err = orch
            .turn(TurnRequest::conversation(owner(), "", "Hello"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn document_turn_uses_document_directive_and_excerpt() {
        let store = InMemoryStore::new();
        let doc = store
            .insert_document(&owner(), NewDocument::new("Notes", "The sky is green here."))
            .await
            .unwrap();
        let provider = Arc::new(EchoProvider::new());
        let orch = Orchestrator::new(Arc::new(store.clone()), provider.clone(), "stub-model");

        let outcome = orch
            .turn(TurnRequest::document(owner(), doc.id.as_str(), "What colour is the sky?"))
            .await
            .unwrap();
        assert_eq!(outcome.text, "echo: What colour is the sky?");
        assert!(!outcome.context.document_truncated);

        let messages = &provider.requests()[0].messages;
        assert_eq!(messages[0].content, Directives::default().document);
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[1].content, "The sky is green here.");

        let thread = store.read(&owner(), &ThreadKey::document(doc.id.as_str())).await.unwrap();
        assert_eq!(thread.len(), 2);
        let conversations = store.read(&owner(), &ThreadKey::conversation(doc.id.as_str())).await.unwrap();
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn document_of_another_owner_is_not_found() {
        let store = InMemoryStore::new();
        let doc = store
            .insert_document(&owner(), NewDocument::new("Private", "secret"))
            .await
            .unwrap();
        let orch = orchestrator(&store, EchoProvider::new());

        let err = orch
            .turn(TurnRequest::document(OwnerId::from("U2"), doc.id.as_str(), "leak?"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::DocumentNotFound(_))
        ));
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn streaming_and_one_shot_persist_identical_text() {
        let chunks = ["echo", ": ", "Hel", "lo"];

        let one_shot_store = InMemoryStore::new();
        let one_shot = orchestrator(&one_shot_store, ChunkedProvider::new(&chunks));
        let a = one_shot
            .turn(TurnRequest::conversation(owner(), "C1", "Hello"))
            .await
            .unwrap();

        let stream_store = InMemoryStore::new();
        let streaming = Arc::new(orchestrator(&stream_store, ChunkedProvider::new(&chunks)));
        let events = drain(streaming.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hello"))).await;

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Chunk { chunk } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, a.text);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last(), Some(&TurnEvent::done("C1", None)));

        let key = ThreadKey::conversation("C1");
        let x = one_shot_store.read(&owner(), &key).await.unwrap();
        let y = stream_store.read(&owner(), &key).await.unwrap();
        assert_eq!(roles_and_text(&x), roles_and_text(&y));
    }

    #[tokio::test]
    async fn partial_stream_failure_persists_accumulated_text() {
        let store = InMemoryStore::new();
        let provider = PartialStreamProvider::new(&["Hel", "lo"], ProviderError::StreamInterrupted("reset".into()));
        let orch = Arc::new(orchestrator(&store, provider));

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hi"))).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TurnEvent::chunk("Hel"));
        assert_eq!(events[1], TurnEvent::chunk("lo"));
        assert!(matches!(events[2], TurnEvent::Error { .. }));

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(
            roles_and_text(&stored),
            vec![(Role::User, "Hi"), (Role::Assistant, "Hello")]
        );
    }

    #[tokio::test]
    async fn stream_failure_before_any_chunk_writes_no_assistant_turn() {
        let store = InMemoryStore::new();
        let orch = Arc::new(orchestrator(
            &store,
            PartialStreamProvider::new(&[], ProviderError::Network("refused".into())),
        ));

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hi"))).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TurnEvent::Error { .. }));

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(roles_and_text(&stored), vec![(Role::User, "Hi")]);
    }

    #[tokio::test]
    async fn dropped_receiver_persists_partial_text() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, ChunkedProvider::new(&["Hel", "lo"]));

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let err = orch
            .turn_streaming(TurnRequest::conversation(owner(), "C1", "Hi"), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(ProviderError::StreamInterrupted(_))));

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(
            roles_and_text(&stored),
            vec![(Role::User, "Hi"), (Role::Assistant, "Hel")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let store = InMemoryStore::new();
        let orch = Arc::new(
            orchestrator(&store, StallingProvider::new(&["wait"]))
                .with_stream_idle_timeout(Duration::from_secs(5)),
        );

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hi"))).await;
        assert_eq!(events[0], TurnEvent::chunk("wait"));
        match &events[1] {
            TurnEvent::Error { error } => assert!(error.contains("timed out")),
            other => panic!("expected error event, got {other:?}"),
        }

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "wait");
    }

    #[tokio::test]
    async fn validation_error_in_stream_is_single_terminal_event() {
        let store = InMemoryStore::new();
        let orch = Arc::new(orchestrator(&store, EchoProvider::new()));

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", ""))).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TurnEvent::Error { .. }));
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_key_interleave_cleanly() {
        let store = InMemoryStore::new();
        let orch = Arc::new(orchestrator(&store, EchoProvider::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move {
                orch.turn(TurnRequest::conversation(owner(), "C1", format!("m{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(stored.len(), 16);
        for pair in stored.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].content, format!("echo: {}", pair[0].content));
        }
        assert_eq!(orch.held_locks(), 0);
    }

    #[tokio::test]
    async fn deleting_one_key_leaves_the_other() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store, EchoProvider::new());
        orch.turn(TurnRequest::conversation(owner(), "C1", "a")).await.unwrap();
        orch.turn(TurnRequest::conversation(owner(), "C2", "b")).await.unwrap();

        let removed = store.delete(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap().is_empty());
        assert_eq!(store.read(&owner(), &ThreadKey::conversation("C2")).await.unwrap().len(), 2);
    }

    #[test]
    fn from_config_applies_limits() {
        let mut config = AppConfig::default();
        config.model = "m".into();
        config.context.document_char_budget = 42;
        config.context.history_token_budget = 0;
        config.engine.serialize_turns = false;
        let orch = Orchestrator::from_config(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(EchoProvider::new()),
        );
        assert_eq!(orch.assembler.budget().document_chars, 42);
        assert_eq!(orch.assembler.budget().history_tokens, None);
        assert!(!orch.serialize_turns);
        assert_eq!(orch.provider_name(), "echo");
    }

    // ── Store failures ──────────────────────────────────────────────────

    /// In-memory store whose appends fail for the listed roles.
    #[derive(Clone)]
    struct RejectingStore {
        inner: InMemoryStore,
        reject: Vec<Role>,
    }

    impl RejectingStore {
        fn rejecting(reject: &[Role]) -> Self {
            Self {
                inner: InMemoryStore::new(),
                reject: reject.to_vec(),
            }
        }
    }

    #[async_trait]
    impl MessageStore for RejectingStore {
        async fn append(
            &self,
            owner: &OwnerId,
            key: &ThreadKey,
            role: Role,
            content: &str,
        ) -> std::result::Result<i64, StoreError> {
            if self.reject.contains(&role) {
                return Err(StoreError::Unavailable("disk detached".into()));
            }
            self.inner.append(owner, key, role, content).await
        }

        async fn read(&self, owner: &OwnerId, key: &ThreadKey) -> std::result::Result<Vec<Message>, StoreError> {
            self.inner.read(owner, key).await
        }

        async fn delete(&self, owner: &OwnerId, key: &ThreadKey) -> std::result::Result<u64, StoreError> {
            self.inner.delete(owner, key).await
        }

        async fn list_conversations(
            &self,
            owner: &OwnerId,
        ) -> std::result::Result<Vec<ConversationSummary>, StoreError> {
            self.inner.list_conversations(owner).await
        }
    }

    #[async_trait]
    impl DocumentStore for RejectingStore {
        async fn insert_document(
            &self,
            owner: &OwnerId,
            doc: NewDocument,
        ) -> std::result::Result<DocumentRecord, StoreError> {
            self.inner.insert_document(owner, doc).await
        }

        async fn get_document(
            &self,
            owner: &OwnerId,
            id: &DocumentId,
        ) -> std::result::Result<Option<DocumentRecord>, StoreError> {
            self.inner.get_document(owner, id).await
        }

        async fn list_documents(&self, owner: &OwnerId) -> std::result::Result<Vec<DocumentRecord>, StoreError> {
            self.inner.list_documents(owner).await
        }

        async fn delete_document(
            &self,
            owner: &OwnerId,
            id: &DocumentId,
        ) -> std::result::Result<Option<DocumentRecord>, StoreError> {
            self.inner.delete_document(owner, id).await
        }
    }

    #[async_trait]
    impl OwnerStore for RejectingStore {
        async fn resolve_owner(&self, session_id: &str) -> std::result::Result<OwnerId, StoreError> {
            self.inner.resolve_owner(session_id).await
        }
    }

    #[tokio::test]
    async fn store_failure_on_user_turn_skips_generation() {
        let store = RejectingStore::rejecting(&[Role::User]);
        let provider = Arc::new(EchoProvider::new());
        let orch = Orchestrator::new(Arc::new(store.clone()), provider.clone(), "stub-model");

        let err = orch
            .turn(TurnRequest::conversation(owner(), "C1", "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
        assert!(provider.requests().is_empty());
        assert_eq!(store.inner.message_count().await, 0);
    }

    #[tokio::test]
    async fn store_failure_on_user_turn_ends_stream_with_one_error() {
        let store = RejectingStore::rejecting(&[Role::User]);
        let provider = Arc::new(EchoProvider::new());
        let orch = Arc::new(Orchestrator::new(Arc::new(store), provider.clone(), "stub-model"));

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hello"))).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            TurnEvent::Error { error } => assert!(error.contains("Store unavailable")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn store_failure_on_assistant_turn_is_reported() {
        let store = RejectingStore::rejecting(&[Role::Assistant]);
        let orch = Orchestrator::new(Arc::new(store.clone()), Arc::new(EchoProvider::new()), "stub-model");

        let err = orch
            .turn(TurnRequest::conversation(owner(), "C1", "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(roles_and_text(&stored), vec![(Role::User, "Hello")]);
    }

    #[tokio::test]
    async fn unpersistable_partial_text_still_ends_with_backend_error() {
        let store = RejectingStore::rejecting(&[Role::Assistant]);
        let provider = PartialStreamProvider::new(&["Hel", "lo"], ProviderError::StreamInterrupted("reset".into()));
        let orch = Arc::new(Orchestrator::new(Arc::new(store.clone()), Arc::new(provider), "stub-model"));

        let events = drain(orch.spawn_stream(TurnRequest::conversation(owner(), "C1", "Hi"))).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.len(), 3);
        match &events[2] {
            TurnEvent::Error { error } => {
                assert!(error.contains("Stream interrupted"));
                assert!(!error.contains("Store"));
            }
            other => panic!("expected error event, got {other:?}"),
        }

        let stored = store.read(&owner(), &ThreadKey::conversation("C1")).await.unwrap();
        assert_eq!(roles_and_text(&stored), vec![(Role::User, "Hi")]);
    }
}
