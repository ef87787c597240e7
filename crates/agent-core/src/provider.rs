//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for completion services, allowing the agent to
//! talk to any OpenAI-compatible backend (or a test double) without changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dm_agent_core::provider::{CompletionRequest, GenerationOptions, LlmProvider};
//!
//! let options = GenerationOptions::new("ai/qwen2.5").temperature(0.0);
//! let request = CompletionRequest::new(conversation.messages().to_vec(), options);
//! let completion = provider.complete(&request).await?;
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::tool::FunctionTool;

/// Configuration for LLM generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Whether the service may return several tool calls at once
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
}

fn default_temperature() -> f32 { 0.5 }

impl GenerationOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
            parallel_tool_calls: None,
        }
    }

    /// Deterministic, one-call-at-a-time settings for tool detection
    pub fn tools_mode(model: impl Into<String>) -> Self {
        Self::new(model).temperature(0.0).parallel_tool_calls(false)
    }

    /// Narrative settings for the streamed reply
    pub fn chat_mode(model: impl Into<String>) -> Self {
        Self::new(model).temperature(default_temperature())
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = Some(enabled);
        self
    }
}

/// A single completion request, built fresh for every phase of every turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub options: GenerationOptions,
    #[serde(default)]
    pub tools: Vec<FunctionTool>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, options: GenerationOptions) -> Self {
        Self {
            messages,
            options,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<FunctionTool>) -> Self {
        self.tools = tools;
        self
    }
}

/// Tool call as emitted by the completion service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object, not yet validated
    pub arguments: String,
}

/// Response from an LLM completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Completion {
    /// The generated text
    pub content: String,

    /// Model that generated this response
    pub model: String,

    /// Tool calls in the order the service returned them
    #[serde(default)]
    pub tool_calls: Vec<DetectedToolCall>,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,
}

/// Token usage statistics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// A chunk from streaming completion
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// The text delta
    pub delta: String,

    /// Whether this is the final chunk
    pub done: bool,

    /// Token usage (typically only on final chunk)
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            done: false,
            usage: None,
        }
    }

    pub fn done() -> Self {
        Self {
            delta: String::new(),
            done: true,
            usage: None,
        }
    }
}

/// Stream type for completion streaming
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Strategy trait for completion services
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, for logs
    fn name(&self) -> &str;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Single-shot completion (used for tool detection)
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Streaming completion (used for the narrated reply)
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<String>>;
}
