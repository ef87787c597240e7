//! Reply Streaming
//!
//! Second completion phase: narrate a reply from persona, tool context and
//! the utterance, fragment by fragment.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt, TryStreamExt, future};
use tracing::debug;

use crate::error::Result;
use crate::message::{Conversation, Message};
use crate::provider::{CompletionRequest, GenerationOptions, LlmProvider};

/// Directive telling the chat model to ignore tool framing when irrelevant
pub const CHAT_DIRECTIVE: &str = "If you detect that the user prompt is related to a tool,
ignore this part and focus on the other parts.";

/// Ordered, finite stream of text fragments. Ends after the first error.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Streaming reply generator
pub struct ReplyStreamer {
    provider: Arc<dyn LlmProvider>,
    options: GenerationOptions,
    directive: String,
}

impl ReplyStreamer {
    pub fn new(provider: Arc<dyn LlmProvider>, options: GenerationOptions) -> Self {
        Self {
            provider,
            options,
            directive: CHAT_DIRECTIVE.into(),
        }
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Append this turn's messages to the chat buffer.
    ///
    /// The tool text is always appended, even when empty.
    pub fn append_turn(&self, chat: &mut Conversation, tool_text: &str, utterance: &str) {
        chat.push(Message::system(tool_text));
        chat.push(Message::system(self.directive.clone()));
        chat.push(Message::user(utterance));
    }

    /// Append the turn and open the reply stream
    pub async fn stream_reply(
        &self,
        chat: &mut Conversation,
        tool_text: &str,
        utterance: &str,
    ) -> Result<ReplyStream> {
        self.append_turn(chat, tool_text, utterance);

        let request = CompletionRequest::new(chat.messages().to_vec(), self.options.clone());
        debug!(
            model = %request.options.model,
            messages = request.messages.len(),
            tokens = chat.estimate_tokens(),
            "Opening reply stream"
        );

        let chunks = self.provider.complete_stream(&request).await?;
        Ok(fragments(chunks))
    }
}

/// Turn provider chunks into non-empty text fragments, stopping after the
/// final chunk or the first error.
fn fragments(chunks: crate::provider::CompletionStream) -> ReplyStream {
    let stream = chunks
        .scan(false, |finished, item| {
            if *finished {
                return future::ready(None);
            }
            let next = match item {
                Ok(chunk) => {
                    *finished = chunk.done;
                    Ok(chunk.delta)
                }
                Err(e) => {
                    *finished = true;
                    Err(e)
                }
            };
            future::ready(Some(next))
        })
        .try_filter(|delta| future::ready(!delta.is_empty()));

    Box::pin(stream)
}
