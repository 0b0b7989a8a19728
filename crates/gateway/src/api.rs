//! Chat and document API.
//!
//! Endpoints (all scoped to the caller's `X-Session-Id`):
//!
//! - `GET    /api/chat/conversations`            - Conversation summaries
//! - `GET    /api/chat/history?conversationId=`  - One conversation's messages
//! - `POST   /api/chat/message`                  - One-shot conversation turn
//! - `POST   /api/chat/message/stream`           - Streaming conversation turn (SSE)
//! - `DELETE /api/chat/conversation/{id}`        - Delete a conversation
//! - `POST   /api/documents`                     - Register an extracted document
//! - `GET    /api/documents`                     - List documents
//! - `GET    /api/documents/{id}`                - One document
//! - `DELETE /api/documents/{id}`                - Delete a document and its chat
//! - `GET    /api/documents/{id}/chat`           - Document chat history
//! - `POST   /api/documents/{id}/chat`           - One-shot document turn
//! - `POST   /api/documents/{id}/chat/stream`    - Streaming document turn (SSE)

use std::convert::Infallible;
use std::path::{Component, Path as FsPath, PathBuf};

use axum::{
    Extension, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{delete, get, post},
};
use chatminds_core::document::{DocumentRecord, NewDocument};
use chatminds_core::message::{ConversationId, ConversationSummary, DocumentId, Message, OwnerId, ThreadKey};
use chatminds_core::ValidationError;
use chatminds_engine::{TurnEvent, TurnRequest};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, trace, warn};

use crate::error::ApiError;
use crate::{SessionId, SharedState};

// ── Router ────────────────────────────────────────────────────────────────

/// Build the `/api` router. Nest this under "/api" in the main router.
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat/conversations", get(list_conversations_handler))
        .route("/chat/history", get(chat_history_handler))
        .route("/chat/message", post(chat_message_handler))
        .route("/chat/message/stream", post(chat_stream_handler))
        .route("/chat/conversation/{id}", delete(delete_conversation_handler))
        .route("/documents", post(ingest_document_handler).get(list_documents_handler))
        .route(
            "/documents/{id}",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route(
            "/documents/{id}/chat",
            get(document_history_handler).post(document_message_handler),
        )
        .route("/documents/{id}/chat/stream", post(document_stream_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub success: bool,
    pub message: String,
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DocumentChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChatResponse {
    pub success: bool,
    pub message: String,
    pub document_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub sequence: i64,
}

impl From<&Message> for HistoryEntry {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.to_string(),
            content: m.content.clone(),
            timestamp: m.created_at.to_rfc3339(),
            sequence: m.sequence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub success: bool,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub deleted: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestDocumentRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    pub text: String,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub num_pages: Option<u32>,
}

/// Document metadata; the full text never leaves the server.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDto {
    pub id: String,
    pub title: String,
    pub char_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pages: Option<u32>,
    pub created_at: String,
}

impl From<&DocumentRecord> for DocumentDto {
    fn from(d: &DocumentRecord) -> Self {
        Self {
            id: d.id.to_string(),
            title: d.title.clone(),
            char_count: d.char_count(),
            num_pages: d.page_count,
            created_at: d.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub success: bool,
    pub document: DocumentDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentListResponse {
    pub success: bool,
    pub documents: Vec<DocumentDto>,
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// `stored` joined onto `uploads_dir`, or `None` unless it is a plain
/// relative path (no root, no prefix, no `..`).
fn confined_path(uploads_dir: &FsPath, stored: &str) -> Option<PathBuf> {
    let relative = FsPath::new(stored);
    let mut named = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => named += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (named > 0).then(|| uploads_dir.join(relative))
}

/// Remove a document's stored file, if it still lives under `uploads_dir`.
async fn remove_stored_file(uploads_dir: &FsPath, stored: &str) {
    let Some(path) = confined_path(uploads_dir, stored) else {
        warn!(path = %stored, "Refusing to remove a file outside the uploads directory");
        return;
    };

    // Symlinks must not lead out of the uploads directory either.
    let target = match tokio::fs::canonicalize(&path).await {
        Ok(target) => target,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not resolve stored document file");
            return;
        }
    };
    let root = match tokio::fs::canonicalize(uploads_dir).await {
        Ok(root) => root,
        Err(e) => {
            warn!(dir = %uploads_dir.display(), error = %e, "Could not resolve uploads directory");
            return;
        }
    };
    if !target.starts_with(&root) {
        warn!(path = %target.display(), "Refusing to remove a file outside the uploads directory");
        return;
    }

    match tokio::fs::remove_file(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %target.display(), error = %e, "Could not remove stored document file"),
    }
}

async fn owner_of(state: &SharedState, session: &SessionId) -> Result<OwnerId, ApiError> {
    Ok(state.store.resolve_owner(session.as_str()).await?)
}

fn conversation_key(id: &str) -> Result<ThreadKey, ApiError> {
    let key = ThreadKey::conversation(id);
    key.validate()?;
    Ok(key)
}

fn require_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyMessage.into());
    }
    Ok(())
}

/// Look the document up, mapping absence to 404.
async fn find_document(state: &SharedState, owner: &OwnerId, id: &str) -> Result<DocumentRecord, ApiError> {
    ThreadKey::document(id).validate()?;
    state
        .store
        .get_document(owner, &DocumentId::from(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Document not found: {id}")))
}

/// Forward a turn's events as unnamed SSE `data:` lines.
fn sse_from(
    rx: tokio::sync::mpsc::Receiver<TurnEvent>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = ReceiverStream::new(rx).map(|event| {
        trace!(event = event.event_type(), "SSE event");
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── Conversations ─────────────────────────────────────────────────────────

async fn list_conversations_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let owner = owner_of(&state, &session).await?;
    let conversations = state.store.list_conversations(&owner).await?;
    Ok(Json(ConversationListResponse {
        success: true,
        conversations,
    }))
}

async fn chat_history_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let id = query
        .conversation_id
        .ok_or_else(|| ApiError::BadRequest("conversationId is required".into()))?;
    let key = conversation_key(&id)?;
    let owner = owner_of(&state, &session).await?;
    let messages = state.store.read(&owner, &key).await?;
    Ok(Json(HistoryResponse {
        success: true,
        history: messages.iter().map(HistoryEntry::from).collect(),
    }))
}

async fn chat_message_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let conversation_id = payload
        .conversation_id
        .unwrap_or_else(|| ConversationId::new().to_string());
    info!(conversation = %conversation_id, "Chat message received");

    let owner = owner_of(&state, &session).await?;
    let outcome = state
        .orchestrator
        .turn(TurnRequest::conversation(owner, &conversation_id, payload.message))
        .await?;

    Ok(Json(ChatResponse {
        success: true,
        message: outcome.text,
        conversation_id,
    }))
}

async fn chat_stream_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let conversation_id = payload
        .conversation_id
        .unwrap_or_else(|| ConversationId::new().to_string());
    require_text(&payload.message)?;
    conversation_key(&conversation_id)?;
    info!(conversation = %conversation_id, "Streaming chat message received");

    let owner = owner_of(&state, &session).await?;
    let rx = state
        .orchestrator
        .spawn_stream(TurnRequest::conversation(owner, &conversation_id, payload.message));
    Ok(sse_from(rx))
}

async fn delete_conversation_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let key = conversation_key(&id)?;
    let owner = owner_of(&state, &session).await?;
    let deleted = state.store.delete(&owner, &key).await?;
    info!(conversation = %id, deleted, "Conversation deleted");
    Ok(Json(DeleteResponse { success: true, deleted }))
}

// ── Documents ─────────────────────────────────────────────────────────────

async fn ingest_document_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Json(req): Json<IngestDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>), ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("Document text must not be empty".into()));
    }
    if let Some(path) = &req.storage_path
        && confined_path(&state.uploads_dir, path).is_none()
    {
        return Err(ApiError::BadRequest(
            "storagePath must be a relative path inside the uploads directory".into(),
        ));
    }
    let owner = owner_of(&state, &session).await?;
    let record = state
        .store
        .insert_document(
            &owner,
            NewDocument {
                title: req.title,
                filename: req.filename,
                text: req.text,
                storage_path: req.storage_path,
                page_count: req.num_pages,
            },
        )
        .await?;
    info!(document = %record.id, chars = record.char_count(), "Document ingested");

    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse {
            success: true,
            document: DocumentDto::from(&record),
        }),
    ))
}

async fn list_documents_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let owner = owner_of(&state, &session).await?;
    let documents = state.store.list_documents(&owner).await?;
    Ok(Json(DocumentListResponse {
        success: true,
        documents: documents.iter().map(DocumentDto::from).collect(),
    }))
}

async fn get_document_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, ApiError> {
    let owner = owner_of(&state, &session).await?;
    let record = find_document(&state, &owner, &id).await?;
    Ok(Json(DocumentResponse {
        success: true,
        document: DocumentDto::from(&record),
    }))
}

async fn delete_document_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, ApiError> {
    ThreadKey::document(&id).validate()?;
    let owner = owner_of(&state, &session).await?;
    let record = state
        .store
        .delete_document(&owner, &DocumentId::from(id.as_str()))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Document not found: {id}")))?;

    if let Some(path) = &record.storage_path {
        remove_stored_file(&state.uploads_dir, path).await;
    }
    info!(document = %id, "Document deleted");

    Ok(Json(DocumentResponse {
        success: true,
        document: DocumentDto::from(&record),
    }))
}

async fn document_history_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let owner = owner_of(&state, &session).await?;
    find_document(&state, &owner, &id).await?;
    let messages = state.store.read(&owner, &ThreadKey::document(&id)).await?;
    Ok(Json(HistoryResponse {
        success: true,
        history: messages.iter().map(HistoryEntry::from).collect(),
    }))
}

async fn document_message_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
    Json(payload): Json<DocumentChatRequest>,
) -> Result<Json<DocumentChatResponse>, ApiError> {
    let owner = owner_of(&state, &session).await?;
    let outcome = state
        .orchestrator
        .turn(TurnRequest::document(owner, &id, payload.message))
        .await?;
    Ok(Json(DocumentChatResponse {
        success: true,
        message: outcome.text,
        document_id: id,
    }))
}

async fn document_stream_handler(
    State(state): State<SharedState>,
    Extension(session): Extension<SessionId>,
    Path(id): Path<String>,
    Json(payload): Json<DocumentChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    require_text(&payload.message)?;
    let owner = owner_of(&state, &session).await?;
    find_document(&state, &owner, &id).await?;

    let rx = state
        .orchestrator
        .spawn_stream(TurnRequest::document(owner, &id, payload.message));
    Ok(sse_from(rx))
}

// ── Tests ─────────────────────────────────────────────────────────────────
