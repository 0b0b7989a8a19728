//! The ChatMinds turn engine.
//!
//! A turn runs in four strict steps:
//!
//! 1. **Persist** the user's text as the next message of the thread
//! 2. **Assemble** directive + document excerpt + prior history + user text
//! 3. **Generate** via the configured provider, one-shot or streaming
//! 4. **Persist** the assistant's answer
//!
//! A backend failure after step 1 never removes the user turn.

pub mod context;
pub mod orchestrator;
pub mod stream_event;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

pub use context::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler, ContextBudget};
pub use orchestrator::{Directives, Orchestrator, TurnOutcome, TurnRequest};
pub use stream_event::TurnEvent;
