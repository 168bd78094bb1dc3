//! LLM integration seam for copy-generation activities.
//!
//! The orchestrator never talks to a model vendor directly; callers plug in an
//! [`LlmClient`] implementation and the activity invoker drives it.

/// Common types for LLM integrations
pub mod types;

// Re-export key components
pub use types::{Completion, CompletionRequest, LlmClient, LlmConfig, Message, MessageRole};
