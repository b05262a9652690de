//! LLM integration for drafting fixes
//!
//! A single `SuggestionBackend` trait covers direct model APIs and MCP
//! bridges alike; which one is used is a configuration choice. The pipeline
//! works without any backend by falling back to static templates.

mod backend;
mod providers;

pub use backend::{parse_suggestion, Suggestion, SuggestionBackend, SuggestionContext};
pub use providers::{create_backend, AnthropicBackend, McpBackend, OpenAiBackend};
