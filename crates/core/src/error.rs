//! Error types for the ChatMinds domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all ChatMinds operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Completion backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] ProviderError),

    // --- Rejected input ---
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The medium cannot be reached (pool closed, I/O failure, timeout).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message text must not be empty")]
    EmptyMessage,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),
}

impl Error {
    /// True when the error was raised before anything was persisted.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
