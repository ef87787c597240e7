//! # dm-agent-core
//!
//! Two-phase completion orchestration for a tool-using conversational agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Agent                                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │    Intent    │   │     Tool     │   │        Reply         │  │
//! │  │   Detector   │──▶│   Executor   │──▶│      Streamer        │  │
//! │  └──────┬───────┘   └──────┬───────┘   └──────────┬───────────┘  │
//! │         │                  │                      │              │
//! │   LlmProvider         ToolClient             LlmProvider         │
//! │   (tools mode)        (registry)             (chat mode)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` and `ToolClient` traits keep the orchestration free of
//! any wire format; `dm-agent-runtime` supplies the HTTP implementations.

pub mod detection;
pub mod error;
pub mod execution;
pub mod message;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod session;
pub mod streaming;
pub mod tool;
pub mod turn;

pub use detection::IntentDetector;
pub use error::{AgentError, Result};
pub use execution::{DispatchMode, ToolExecutor};
pub use message::{Conversation, Message, Role};
pub use provider::{CompletionRequest, GenerationOptions, LlmProvider};
pub use reasoning::{Agent, AgentBuilder, AgentConfig};
pub use session::{Operator, Session, SessionPrompts, run_session};
pub use streaming::{ReplyStream, ReplyStreamer};
pub use tool::{ToolCallRequest, ToolCallResult, ToolCatalog, ToolClient, ToolDefinition, ToolInvoker};
pub use turn::{TurnObserver, TurnOutcome, TurnState};
