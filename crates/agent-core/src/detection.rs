//! Intent Detection
//!
//! First completion phase: decide which tools the utterance needs.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::message::{Conversation, Message};
use crate::provider::{CompletionRequest, GenerationOptions, LlmProvider};
use crate::tool::{ToolCallRequest, ToolCatalog};

/// Directive scoping the tools-mode model to tool selection
pub const TOOLS_DIRECTIVE: &str = "Your job is to understand the user prompt and decide if you need to use tools to run external commands.
Ignore all things not related to the usage of a tool";

/// Tool-intent detector
///
/// Every call starts from an empty tools buffer, so earlier turns never
/// influence which tools are chosen.
pub struct IntentDetector {
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
    directive: String,
}

impl IntentDetector {
    pub fn new(provider: Arc<dyn LlmProvider>, options: GenerationOptions) -> Self {
        Self {
            provider,
            options,
            directive: TOOLS_DIRECTIVE.into(),
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Fresh tools buffer: directive + utterance, nothing else
    pub fn tools_buffer(&self, utterance: &str) -> Conversation {
        let mut buffer = Conversation::with_system_prompt(self.directive.clone());
        buffer.push(Message::user(utterance));
        buffer
    }

    /// Deterministic, non-parallel request carrying the whole catalog
    pub fn build_request(&self, utterance: &str, catalog: &ToolCatalog) -> CompletionRequest {
        let options = self.options.clone().temperature(0.0).parallel_tool_calls(false);

        CompletionRequest::new(self.tools_buffer(utterance).messages().to_vec(), options)
            .with_tools(catalog.function_tools())
    }

    /// Tool calls requested for this utterance, in the order returned
    pub async fn detect(&self, utterance: &str, catalog: &ToolCatalog) -> Result<Vec<ToolCallRequest>> {
        if catalog.is_empty() {
            debug!("Empty tool catalog, skipping detection");
            return Ok(Vec::new());
        }

        let request = self.build_request(utterance, catalog);
        let completion = self.provider.complete(&request).await?;

        let requests: Vec<ToolCallRequest> = completion
            .tool_calls
            .into_iter()
            .map(|call| ToolCallRequest::from_encoded(call.name, &call.arguments).with_call_id(call.id))
            .collect();

        debug!(count = requests.len(), model = %self.options.model, "Tool detection complete");
        Ok(requests)
    }
}
