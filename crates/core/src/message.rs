//! Message, identity and thread-key domain types.
//!
//! A stored [`Message`] always belongs to exactly one owner and one thread.
//! The provider-neutral [`ChatMessage`] is what gets sent to a backend; it is
//! rebuilt on every turn and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Longest accepted conversation or document key.
pub const MAX_KEY_LEN: usize = 128;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Mint a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Opaque per-session identity. Every message and document is scoped to one.
    OwnerId
);

string_id!(
    /// Client-minted identifier grouping a run of messages into one thread.
    ConversationId
);

string_id!(
    /// Identifier of an ingested document.
    DocumentId
);

/// Which message partition a thread lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ThreadKey {
    Conversation(ConversationId),
    Document(DocumentId),
}

impl ThreadKey {
    pub fn conversation(id: &str) -> Self {
        Self::Conversation(ConversationId::from(id))
    }

    pub fn document(id: &str) -> Self {
        Self::Document(DocumentId::from(id))
    }

    /// The raw identifier, regardless of partition.
    pub fn id(&self) -> &str {
        match self {
            Self::Conversation(id) => id.as_str(),
            Self::Document(id) => id.as_str(),
        }
    }

    /// Reject keys that are empty, oversized, or contain control characters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let id = self.id();
        if id.trim().is_empty() {
            return Err(ValidationError::InvalidKey("key is empty".into()));
        }
        if id.chars().count() > MAX_KEY_LEN {
            return Err(ValidationError::InvalidKey(format!(
                "key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidKey(
                "key contains control characters".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Document(id) => write!(f, "document:{id}"),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (directive, document excerpt)
    System,
    /// The end user
    User,
    /// The model
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A persisted, immutable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub owner: OwnerId,

    pub key: ThreadKey,

    pub role: Role,

    pub content: String,

    pub created_at: DateTime<Utc>,

    /// Monotonic position within `key`, starting at 1.
    pub sequence: i64,
}

/// One entry of the provider-neutral message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self { role: msg.role, content: msg.content.clone() }
    }
}

/// Derived listing row for an owner's conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub message_count: i64,
    /// First user message, cut to [`PREVIEW_CHARS`].
    pub preview: String,
    pub last_activity: DateTime<Utc>,
}

/// Length of [`ConversationSummary::preview`].
pub const PREVIEW_CHARS: usize = 80;

/// Cut `text` to at most `max_chars` Unicode scalar values.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_its_own_wire_name() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn thread_key_rejects_bad_ids() {
        assert!(ThreadKey::conversation("C1").validate().is_ok());
        assert!(ThreadKey::conversation("").validate().is_err());
        assert!(ThreadKey::conversation("   ").validate().is_err());
        assert!(ThreadKey::document("a\nb").validate().is_err());
        let long = "x".repeat(MAX_KEY_LEN + 1);
        assert!(ThreadKey::conversation(&long).validate().is_err());
    }

    #[test]
    fn thread_keys_in_different_partitions_differ() {
        assert_ne!(ThreadKey::conversation("x"), ThreadKey::document("x"));
        assert_eq!(ThreadKey::document("x").to_string(), "document:x");
    }

    #[test]
    fn truncate_chars_counts_scalars_not_bytes() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = ConversationId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
