//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Missing or invalid startup configuration (the only fatal kind)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool registry or completion service unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed or unexpected response from a remote service
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tool-call arguments could not be decoded
    #[error("Argument decode error: {0}")]
    ArgumentDecode(String),

    /// Tool not present in the catalog
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The registry reported the tool call as failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Transport failure in the middle of a streamed reply
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Only configuration errors halt the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Config(msg) => format!("Configuration problem: {}", msg),
            AgentError::Connectivity(_) => {
                "The remote service is currently unreachable. Please try again.".into()
            }
            AgentError::Protocol(msg) => format!("The remote service sent an unexpected response: {}", msg),
            AgentError::ArgumentDecode(msg) => format!("Invalid tool arguments: {}", msg),
            AgentError::ToolNotFound(name) => format!("The tool '{}' is not available.", name),
            AgentError::ToolExecution(msg) => format!("Tool error: {}", msg),
            AgentError::StreamInterrupted(_) => "The response stream was cut off.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}
