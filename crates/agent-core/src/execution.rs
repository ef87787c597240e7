//! Tool Execution
//!
//! Runs the detected calls and folds their text into one context block.

use futures::StreamExt;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::tool::{ToolCallRequest, ToolCallResult, ToolCatalog, ToolInvoker};
use crate::turn::TurnObserver;

/// How detected calls are dispatched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// One call at a time, in detection order
    #[default]
    Sequential,

    /// Up to `max_in_flight` calls at once. Output is still folded in
    /// detection order, but later calls no longer observe earlier ones.
    Concurrent { max_in_flight: usize },
}

impl DispatchMode {
    /// `0` and `1` mean sequential
    pub fn from_limit(limit: usize) -> Self {
        if limit > 1 {
            DispatchMode::Concurrent { max_in_flight: limit }
        } else {
            DispatchMode::Sequential
        }
    }
}

/// Tool execution aggregator
#[derive(Clone)]
pub struct ToolExecutor {
    invoker: ToolInvoker,
    mode: DispatchMode,
}

impl ToolExecutor {
    pub fn new(invoker: ToolInvoker) -> Self {
        Self {
            invoker,
            mode: DispatchMode::Sequential,
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Execute every request and return the aggregated text.
    ///
    /// Each successful output is followed by a newline. Failures are reported
    /// to the observer and skipped. Empty when nothing succeeded.
    pub async fn execute(
        &self,
        requests: &[ToolCallRequest],
        catalog: &ToolCatalog,
        observer: &mut dyn TurnObserver,
    ) -> String {
        let mut aggregated = String::new();

        match self.mode {
            DispatchMode::Sequential => {
                for request in requests {
                    let result = self.run_one(request, catalog).await;
                    fold(&mut aggregated, &result, observer);
                }
            }
            DispatchMode::Concurrent { max_in_flight } => {
                let mut results = futures::stream::iter(requests)
                    .map(|request| self.run_one(request, catalog))
                    .buffered(max_in_flight.max(1));

                while let Some(result) = results.next().await {
                    fold(&mut aggregated, &result, observer);
                }
            }
        }

        aggregated
    }

    async fn run_one(&self, request: &ToolCallRequest, catalog: &ToolCatalog) -> ToolCallResult {
        if !catalog.contains(&request.tool_name) {
            return ToolCallResult::failure(
                &request.tool_name,
                AgentError::ToolNotFound(request.tool_name.clone()).to_string(),
            );
        }

        self.invoker.invoke(&request.tool_name, &request.arguments).await
    }
}

fn fold(aggregated: &mut String, result: &ToolCallResult, observer: &mut dyn TurnObserver) {
    match (&result.text_output, result.succeeded) {
        (Some(text), true) => {
            info!(tool = %result.tool_name, "Tool executed");
            aggregated.push_str(text);
            aggregated.push('\n');
        }
        _ => {
            warn!(
                tool = %result.tool_name,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Skipping failed tool"
            );
        }
    }
    observer.on_tool_result(result);
}
