//! In-memory store - useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chatminds_core::document::{DocumentRecord, NewDocument};
use chatminds_core::error::StoreError;
use chatminds_core::message::{
    truncate_chars, ConversationId, ConversationSummary, DocumentId, Message, OwnerId, Role,
    ThreadKey, PREVIEW_CHARS,
};
use chatminds_core::store::{DocumentStore, MessageStore, OwnerStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    owners: HashMap<String, OwnerId>,
    threads: HashMap<(OwnerId, ThreadKey), Vec<Message>>,
    documents: Vec<DocumentRecord>,
    /// Bumped on every append; orders conversation listings.
    clock: u64,
    last_touch: HashMap<(OwnerId, ThreadKey), u64>,
}

/// An in-memory store with the same semantics as the SQLite one.
/// Useful for testing and sessions where persistence isn't needed.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages across all owners and threads.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.threads.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append(
        &self,
        owner: &OwnerId,
        key: &ThreadKey,
        role: Role,
        content: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;

        if let ThreadKey::Document(id) = key
            && !inner.documents.iter().any(|d| &d.id == id)
        {
            return Err(StoreError::QueryFailed(format!(
                "append: document {id} does not exist"
            )));
        }

        inner.clock += 1;
        let tick = inner.clock;
        let slot = (owner.clone(), key.clone());
        inner.last_touch.insert(slot.clone(), tick);

        let thread = inner.threads.entry(slot).or_default();
        let sequence = thread.last().map_or(1, |m| m.sequence + 1);
        thread.push(Message {
            owner: owner.clone(),
            key: key.clone(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            sequence,
        });
        Ok(sequence)
    }

    async fn read(&self, owner: &OwnerId, key: &ThreadKey) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .threads
            .get(&(owner.clone(), key.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, owner: &OwnerId, key: &ThreadKey) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let slot = (owner.clone(), key.clone());
        inner.last_touch.remove(&slot);
        Ok(inner.threads.remove(&slot).map_or(0, |t| t.len() as u64))
    }

    async fn list_conversations(&self, owner: &OwnerId) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<(u64, ConversationSummary)> = inner
            .threads
            .iter()
            .filter_map(|((o, key), messages)| {
                let ThreadKey::Conversation(id) = key else {
                    return None;
                };
                if o != owner || messages.is_empty() {
                    return None;
                }
                let preview = messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| truncate_chars(&m.content, PREVIEW_CHARS).to_string())
                    .unwrap_or_default();
                let last = messages.last()?;
                let tick = inner
                    .last_touch
                    .get(&(o.clone(), key.clone()))
                    .copied()
                    .unwrap_or_default();
                Some((
                    tick,
                    ConversationSummary {
                        conversation_id: ConversationId(id.0.clone()),
                        message_count: messages.len() as i64,
                        preview,
                        last_activity: last.created_at,
                    },
                ))
            })
            .collect();

        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().map(|(_, s)| s).collect())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert_document(&self, owner: &OwnerId, doc: NewDocument) -> Result<DocumentRecord, StoreError> {
        let record = DocumentRecord {
            owner: owner.clone(),
            id: DocumentId::new(),
            title: doc.resolved_title(),
            text: doc.text,
            storage_path: doc.storage_path,
            page_count: doc.page_count,
            created_at: Utc::now(),
        };
        self.inner.write().await.documents.push(record.clone());
        Ok(record)
    }

    async fn get_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .iter()
            .find(|d| &d.id == id && &d.owner == owner)
            .cloned())
    }

    async fn list_documents(&self, owner: &OwnerId) -> Result<Vec<DocumentRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .iter()
            .rev()
            .filter(|d| &d.owner == owner)
            .cloned()
            .collect())
    }

    async fn delete_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(pos) = inner
            .documents
            .iter()
            .position(|d| &d.id == id && &d.owner == owner)
        else {
            return Ok(None);
        };
        let record = inner.documents.remove(pos);
        let key = ThreadKey::Document(id.clone());
        inner.threads.retain(|(_, k), _| k != &key);
        inner.last_touch.retain(|(_, k), _| k != &key);
        Ok(Some(record))
    }
}

#[async_trait]
impl OwnerStore for InMemoryStore {
    async fn resolve_owner(&self, session_id: &str) -> Result<OwnerId, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .owners
            .entry(session_id.to_string())
            .or_insert_with(OwnerId::new)
            .clone())
    }
}
