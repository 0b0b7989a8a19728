//! Turn-level streaming events.
//!
//! A streaming turn emits zero or more `Chunk` events in arrival order,
//! then exactly one terminal `Done` or `Error`. The JSON shape is what the
//! gateway writes into each SSE `data:` line.

use chatminds_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Events emitted while a streaming turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnEvent {
    /// A fragment of assistant text.
    Chunk { chunk: String },

    /// The assistant turn was persisted.
    Done {
        done: bool,
        #[serde(rename = "conversationId")]
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Generation or persistence failed; delivered chunks are not retracted.
    Error { error: String },
}

impl TurnEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk { chunk: text.into() }
    }

    pub fn done(key: impl Into<String>, usage: Option<Usage>) -> Self {
        Self::Done {
            done: true,
            key: key.into(),
            usage,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}
