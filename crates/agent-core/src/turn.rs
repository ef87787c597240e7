//! Turn State
//!
//! States a turn moves through, the observer that renders them, and the
//! terminal outcome handed back to the session loop.

use crate::error::AgentError;
use crate::tool::{ToolCallRequest, ToolCallResult};

/// Turn state machine
///
/// `Idle → DetectingIntent → (ExecutingTools)? → StreamingReply → Idle`.
/// Any failure goes straight back to `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    DetectingIntent,
    ExecutingTools,
    StreamingReply,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnState::Idle => write!(f, "idle"),
            TurnState::DetectingIntent => write!(f, "detecting-intent"),
            TurnState::ExecutingTools => write!(f, "executing-tools"),
            TurnState::StreamingReply => write!(f, "streaming-reply"),
        }
    }
}

/// Receives turn progress as it happens
///
/// Fragments must be rendered as soon as `on_fragment` is called.
pub trait TurnObserver: Send {
    fn on_state(&mut self, _state: TurnState) {}

    /// Detection failed; the turn continues with no tools
    fn on_detection_failed(&mut self, _error: &AgentError) {}

    fn on_tool_detected(&mut self, _request: &ToolCallRequest) {}

    fn on_tool_result(&mut self, _result: &ToolCallResult) {}

    fn on_fragment(&mut self, _fragment: &str) {}

    /// Short operator-facing line describing a recoverable failure
    fn on_diagnostic(&mut self, _message: &str) {}

    fn on_interrupted(&mut self) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl TurnObserver for NoopObserver {}

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply streamed to completion
    Completed { reply: String },

    /// The operator interrupted the reply; `partial` stays on screen
    Interrupted { partial: String },

    /// The reply could not be produced (or was cut off)
    Failed { error: AgentError, partial: String },
}

impl TurnOutcome {
    /// Text that reached the operator
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Completed { reply } => reply,
            TurnOutcome::Interrupted { partial } | TurnOutcome::Failed { partial, .. } => partial,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}
