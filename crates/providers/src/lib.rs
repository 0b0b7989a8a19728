//! Completion backend implementations for ChatMinds.
//!
//! All providers implement the `chatminds_core::Provider` trait.
//! The factory builds the one active provider from configuration.

pub mod factory;
pub mod gemini;
mod http;
pub mod openai_compat;
pub mod sse;

pub use factory::build_from_config;
pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use sse::SseDecoder;
