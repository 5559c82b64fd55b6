//! LLM client abstractions
//!
//! Chat types plus an OpenAI-compatible client. The `ChatClient` trait is
//! the seam the agent loop depends on, so tests can script model behaviour
//! without a network.

pub mod chat;
pub mod client;

pub use chat::{ChatMessage, ChatRequest, ChatResponse, ChatTool, MessageRole, ToolCall};
pub use client::{ChatClient, LlmClient};

use serde::{Deserialize, Serialize};

/// Accumulated token usage across a session or turn
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Fold another usage report into this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
