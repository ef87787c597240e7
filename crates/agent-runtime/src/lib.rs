//! # dm-agent-runtime
//!
//! Network implementations of the `dm-agent-core` seams.
//!
//! ## Integrations
//!
//! - **OpenAI-compatible completions**: `/chat/completions` with tool
//!   definitions or SSE streaming (Docker Model Runner, Ollama `/v1`, vLLM)
//! - **MCP tool registry**: streamable HTTP transport, JSON-RPC 2.0
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dm_agent_runtime::{McpConfig, McpHttpClient, OpenAiCompatProvider};
//!
//! let provider = Arc::new(OpenAiCompatProvider::new("http://localhost:12434/engines/v1", "")?);
//! let registry = Arc::new(McpHttpClient::new(McpConfig::new("http://localhost:9011/mcp"))?);
//! let agent = AgentBuilder::new()
//!     .provider(provider)
//!     .tool_client(registry)
//!     .config(AgentConfig::new("ai/qwen2.5", "ai/gemma3"))
//!     .build()
//!     .await?;
//! ```

pub mod mcp;
pub mod openai;
pub mod sse;

pub use mcp::{McpConfig, McpHttpClient};
pub use openai::{OpenAiCompatProvider, OpenAiConfig};

// Re-export core types for convenience
pub use dm_agent_core::{Agent, AgentError, LlmProvider, Message, Result, Role, Session, ToolClient};
