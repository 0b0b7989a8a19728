//! # ChatMinds Core
//!
//! Domain types, traits, and error definitions for the ChatMinds
//! completion-orchestration engine. This crate performs no I/O - it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every seam is a trait here. Implementations live in their respective
//! crates. This enables:
//! - Swapping the store or the completion backend via configuration
//! - Easy testing with stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod provider;
pub mod document;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, StoreError, ValidationError};
pub use message::{
    ChatMessage, ConversationId, ConversationSummary, DocumentId, Message, OwnerId, Role, ThreadKey,
};
pub use provider::{GenerationParams, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use document::{DocumentRecord, NewDocument};
pub use store::{DocumentStore, MessageStore, OwnerStore, Store};
