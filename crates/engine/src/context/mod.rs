//! Context assembly: the ordered, bounded message list sent to the backend.
//!
//! | Position | Source | Trim Strategy |
//! |----------|--------|---------------|
//! | 1. Directive | Configured system prompt | Never trimmed |
//! | 2. Document excerpt | Document text | Prefix cut at the character budget |
//! | 3. History | Stored turns | Oldest turns dropped when over the token budget |
//! | 4. New user turn | Caller text | Never trimmed |

pub mod assembler;
pub mod token;

pub use assembler::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, ContextBudget};
