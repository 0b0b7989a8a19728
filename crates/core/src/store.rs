//! Store traits - the read/write contract the engine needs from persistence.
//!
//! Messages are partitioned by owner and [`ThreadKey`]. Within a key,
//! sequences start at 1 and only grow; messages are never updated.
//! `append` must be durable before it returns.

use async_trait::async_trait;

use crate::document::{DocumentRecord, NewDocument};
use crate::error::StoreError;
use crate::message::{ConversationSummary, DocumentId, Message, OwnerId, Role, ThreadKey};

/// Append-only message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message and return its sequence within `key`.
    async fn append(
        &self,
        owner: &OwnerId,
        key: &ThreadKey,
        role: Role,
        content: &str,
    ) -> Result<i64, StoreError>;

    /// All messages of `key`, in sequence order.
    async fn read(&self, owner: &OwnerId, key: &ThreadKey) -> Result<Vec<Message>, StoreError>;

    /// Remove every message of `key`. Returns how many were removed.
    async fn delete(&self, owner: &OwnerId, key: &ThreadKey) -> Result<u64, StoreError>;

    /// The owner's conversations, most recent activity first.
    async fn list_conversations(&self, owner: &OwnerId) -> Result<Vec<ConversationSummary>, StoreError>;
}

/// Ingested documents. Deleting a document cascades to its messages.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, owner: &OwnerId, doc: NewDocument) -> Result<DocumentRecord, StoreError>;

    /// `None` when the document does not exist or belongs to another owner.
    async fn get_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError>;

    /// Newest first.
    async fn list_documents(&self, owner: &OwnerId) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Remove the document and all of its messages atomically.
    /// Returns the removed record so callers can clean up the stored file.
    async fn delete_document(&self, owner: &OwnerId, id: &DocumentId) -> Result<Option<DocumentRecord>, StoreError>;
}

/// Session → owner resolution.
#[async_trait]
pub trait OwnerStore: Send + Sync {
    /// Return the owner for `session_id`, creating it on first contact.
    async fn resolve_owner(&self, session_id: &str) -> Result<OwnerId, StoreError>;
}

/// Everything the orchestrator and the outer surfaces need.
pub trait Store: MessageStore + DocumentStore + OwnerStore {}

impl<T: MessageStore + DocumentStore + OwnerStore + ?Sized> Store for T {}
