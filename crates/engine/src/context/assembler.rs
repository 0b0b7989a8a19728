//! Context assembler.
//!
//! Builds the provider-neutral message list for one turn:
//!
//! 1. **Directive** - one system entry, verbatim
//! 2. **Document excerpt** - one system entry holding a hard prefix cut of the
//!    document text, at most `document_chars` Unicode scalar values
//! 3. **History** - stored turns in stored order, roles preserved; when a
//!    token budget is set, only the newest contiguous run that fits is kept
//! 4. **User turn** - the new text, last
//!
//! # Determinism
//!
//! Identical inputs always produce identical outputs. Nothing is reordered
//! or deduplicated.

use crate::context::token;
use chatminds_core::message::{truncate_chars, ChatMessage, Message};
use serde::{Deserialize, Serialize};

/// Size limits applied during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    /// Maximum characters of document text.
    pub document_chars: usize,
    /// Estimated-token ceiling for replayed history. `None` replays everything.
    pub history_tokens: Option<usize>,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            document_chars: 15_000,
            history_tokens: None,
        }
    }
}

impl ContextBudget {
    /// Build from config values, where a zero history budget means unbounded.
    pub fn from_limits(document_chars: usize, history_tokens: usize) -> Self {
        Self {
            document_chars,
            history_tokens: (history_tokens > 0).then_some(history_tokens),
        }
    }
}

/// All inputs for one assembly.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub directive: &'a str,
    pub document: Option<&'a str>,
    /// Prior turns, oldest first. Must not already contain the new user turn.
    pub history: &'a [Message],
    pub user_text: &'a str,
}

/// The assembled context, ready for a provider request.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub metadata: AssemblyMetadata,
}

/// What the assembler kept and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Characters of document text included.
    pub document_chars: usize,
    /// Whether the document was longer than the budget.
    pub document_truncated: bool,
    pub history_included: usize,
    pub history_available: usize,
    pub history_dropped: usize,
    /// Estimated tokens of the whole message list.
    pub estimated_tokens: usize,
}

/// Assembles model input from directive, document, history and user text.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    budget: ContextBudget,
}

impl ContextAssembler {
    pub fn new(budget: ContextBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    pub fn assemble(&self, input: &AssemblyInput<'_>) -> AssembledContext {
        let mut metadata = AssemblyMetadata {
            history_available: input.history.len(),
            ..Default::default()
        };
        let mut messages = Vec::with_capacity(input.history.len() + 3);

        messages.push(ChatMessage::system(input.directive));

        if let Some(text) = input.document {
            let excerpt = self.document_excerpt(text);
            metadata.document_chars = excerpt.chars().count();
            metadata.document_truncated = excerpt.len() < text.len();
            messages.push(ChatMessage::system(excerpt));
        }

        let window = self.history_window(input.history);
        metadata.history_included = window.len();
        metadata.history_dropped = input.history.len() - window.len();
        messages.extend(window.iter().map(ChatMessage::from));

        messages.push(ChatMessage::user(input.user_text));

        metadata.estimated_tokens = token::estimate_messages_tokens(&messages);
        AssembledContext { messages, metadata }
    }

    /// Hard prefix cut of `text` to the document budget.
    pub fn document_excerpt<'t>(&self, text: &'t str) -> &'t str {
        truncate_chars(text, self.budget.document_chars)
    }

    /// Newest contiguous run of `history` within the token budget.
    fn history_window<'h>(&self, history: &'h [Message]) -> &'h [Message] {
        let Some(budget) = self.budget.history_tokens else {
            return history;
        };

        let mut used = 0;
        let mut start = history.len();
        // Walk newest → oldest; the first turn that does not fit ends the window.
        for (idx, msg) in history.iter().enumerate().rev() {
            let cost = token::MESSAGE_OVERHEAD + token::estimate_tokens(&msg.content);
            if used + cost > budget {
                break;
            }
            used += cost;
            start = idx;
        }
        &history[start..]
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
