//! Turn Orchestration
//!
//! Two-phase completion loop: detect tool intents, run the tools, then
//! stream a narrated reply built on their output.
//!
//! ```text
//! utterance ─▶ IntentDetector ─▶ ToolExecutor ─▶ ReplyStreamer ─▶ fragments
//!              (tools model)     (registry)      (chat model)
//! ```

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detection::{IntentDetector, TOOLS_DIRECTIVE};
use crate::error::{AgentError, Result};
use crate::execution::{DispatchMode, ToolExecutor};
use crate::message::Message;
use crate::provider::{GenerationOptions, LlmProvider};
use crate::session::Session;
use crate::streaming::{CHAT_DIRECTIVE, ReplyStreamer};
use crate::tool::{ToolCatalog, ToolClient, ToolInvoker};
use crate::turn::{TurnObserver, TurnOutcome, TurnState};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Tools-mode generation options (temperature is pinned to 0)
    pub tools: GenerationOptions,

    /// Chat-mode generation options
    pub chat: GenerationOptions,

    /// System directive for the detection phase
    pub tools_directive: String,

    /// System directive appended before each utterance in the chat phase
    pub chat_directive: String,

    /// How detected tool calls are dispatched
    pub dispatch: DispatchMode,

    /// Append completed replies to the chat buffer
    pub remember_replies: bool,
}

impl AgentConfig {
    pub fn new(tools_model: impl Into<String>, chat_model: impl Into<String>) -> Self {
        Self {
            tools: GenerationOptions::tools_mode(tools_model),
            chat: GenerationOptions::chat_mode(chat_model),
            tools_directive: TOOLS_DIRECTIVE.into(),
            chat_directive: CHAT_DIRECTIVE.into(),
            dispatch: DispatchMode::Sequential,
            remember_replies: false,
        }
    }
}

/// The main Agent struct
pub struct Agent {
    catalog: Arc<ToolCatalog>,
    detector: IntentDetector,
    executor: ToolExecutor,
    streamer: ReplyStreamer,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        tools_provider: Arc<dyn LlmProvider>,
        chat_provider: Arc<dyn LlmProvider>,
        tool_client: Arc<dyn ToolClient>,
        catalog: Arc<ToolCatalog>,
        config: AgentConfig,
    ) -> Self {
        let detector = IntentDetector::new(tools_provider, config.tools.clone())
            .with_directive(config.tools_directive.clone());
        let executor = ToolExecutor::new(ToolInvoker::new(tool_client)).with_mode(config.dispatch);
        let streamer = ReplyStreamer::new(chat_provider, config.chat.clone())
            .with_directive(config.chat_directive.clone());

        Self {
            catalog,
            detector,
            executor,
            streamer,
            config,
        }
    }

    /// Run one turn to a terminal outcome.
    ///
    /// Never returns an error: detection and tool failures degrade the
    /// context, reply failures end the turn with a diagnostic. Only the
    /// streaming phase honors `cancel`.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        utterance: &str,
        observer: &mut dyn TurnObserver,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let turn = session.begin_turn();
        debug!(session = %session.id, turn, "Starting turn");

        observer.on_state(TurnState::DetectingIntent);
        let requests = match self.detector.detect(utterance, &self.catalog).await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Tool detection failed, continuing without tools");
                observer.on_detection_failed(&e);
                observer.on_diagnostic(&format!("Tools completion error: {e}"));
                Vec::new()
            }
        };

        let tool_text = if requests.is_empty() {
            String::new()
        } else {
            for request in &requests {
                observer.on_tool_detected(request);
            }
            observer.on_state(TurnState::ExecutingTools);
            self.executor.execute(&requests, &self.catalog, observer).await
        };

        observer.on_state(TurnState::StreamingReply);
        let outcome = self.stream(session, &tool_text, utterance, observer, cancel).await;
        observer.on_state(TurnState::Idle);

        info!(session = %session.id, turn, completed = outcome.is_completed(), "Turn finished");
        outcome
    }

    async fn stream(
        &self,
        session: &mut Session,
        tool_text: &str,
        utterance: &str,
        observer: &mut dyn TurnObserver,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        // Interrupted before the reply opened: send nothing, append nothing
        if cancel.is_cancelled() {
            debug!("Turn cancelled before streaming");
            observer.on_interrupted();
            return TurnOutcome::Interrupted { partial: String::new() };
        }

        let mut stream = match self.streamer.stream_reply(session.chat_mut(), tool_text, utterance).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(error = %error, "Chat completion failed");
                observer.on_diagnostic(&format!("Stream error: {error}"));
                return TurnOutcome::Failed {
                    error,
                    partial: String::new(),
                };
            }
        };

        let mut reply = String::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(chars = reply.len(), "Reply interrupted");
                    observer.on_interrupted();
                    return TurnOutcome::Interrupted { partial: reply };
                }
                next = stream.next() => match next {
                    Some(Ok(fragment)) => {
                        observer.on_fragment(&fragment);
                        reply.push_str(&fragment);
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "Reply stream failed");
                        observer.on_diagnostic(&format!("Stream error: {error}"));
                        return TurnOutcome::Failed { error, partial: reply };
                    }
                    None => break,
                },
            }
        }

        if self.config.remember_replies {
            session.chat_mut().push(Message::assistant(reply.clone()));
        }

        TurnOutcome::Completed { reply }
    }

    /// Get the tool catalog
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
#[derive(Default)]
pub struct AgentBuilder {
    tools_provider: Option<Arc<dyn LlmProvider>>,
    chat_provider: Option<Arc<dyn LlmProvider>>,
    tool_client: Option<Arc<dyn ToolClient>>,
    catalog: Option<ToolCatalog>,
    config: Option<AgentConfig>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the same completion service for both phases
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.tools_provider = Some(provider.clone());
        self.chat_provider = Some(provider);
        self
    }

    pub fn tools_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.tools_provider = Some(provider);
        self
    }

    pub fn chat_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.chat_provider = Some(provider);
        self
    }

    pub fn tool_client(mut self, client: Arc<dyn ToolClient>) -> Self {
        self.tool_client = Some(client);
        self
    }

    pub fn catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the agent, fetching the catalog if none was supplied
    pub async fn build(self) -> Result<Agent> {
        let tools_provider = self
            .tools_provider
            .ok_or_else(|| AgentError::Config("Tools provider is required".into()))?;
        let chat_provider = self
            .chat_provider
            .ok_or_else(|| AgentError::Config("Chat provider is required".into()))?;
        let tool_client = self
            .tool_client
            .ok_or_else(|| AgentError::Config("Tool client is required".into()))?;
        let config = self
            .config
            .ok_or_else(|| AgentError::Config("Agent configuration is required".into()))?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ToolCatalog::fetch(tool_client.as_ref()).await?,
        };

        Ok(Agent::new(
            tools_provider,
            chat_provider,
            tool_client,
            Arc::new(catalog),
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::mock::{MockProvider, MockToolClient};
    use crate::provider::StreamChunk;
    use crate::tool::{ToolCallRequest, ToolCallResult, ToolDefinition, ToolOutput};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        states: Vec<TurnState>,
        detected: Vec<ToolCallRequest>,
        results: Vec<ToolCallResult>,
        fragments: Vec<String>,
        diagnostics: Vec<String>,
        detection_failures: usize,
        interrupted: bool,
    }

    impl TurnObserver for Recorder {
        fn on_state(&mut self, state: TurnState) {
            self.states.push(state);
        }
        fn on_tool_detected(&mut self, request: &ToolCallRequest) {
            self.detected.push(request.clone());
        }
        fn on_tool_result(&mut self, result: &ToolCallResult) {
            self.results.push(result.clone());
        }
        fn on_fragment(&mut self, fragment: &str) {
            self.fragments.push(fragment.to_string());
        }
        fn on_diagnostic(&mut self, message: &str) {
            self.diagnostics.push(message.to_string());
        }
        fn on_detection_failed(&mut self, _error: &AgentError) {
            self.detection_failures += 1;
        }
        fn on_interrupted(&mut self) {
            self.interrupted = true;
        }
    }

    fn search_catalog() -> ToolCatalog {
        ToolCatalog::new(vec![
            ToolDefinition::new("search", "Search the lore")
                .with_property("query", json!({"type": "string"}), true),
        ])
    }

    async fn agent(provider: Arc<MockProvider>, client: Arc<MockToolClient>, catalog: ToolCatalog) -> Agent {
        AgentBuilder::new()
            .provider(provider)
            .tool_client(client)
            .catalog(catalog)
            .config(AgentConfig::new("tools-model", "chat-model"))
            .build()
            .await
            .unwrap()
    }

    fn session() -> Session {
        Session::with_persona("A grumpy dwarf.", "Stay in character.")
    }

    #[tokio::test]
    async fn test_no_tools_goes_straight_to_streaming() {
        let provider = Arc::new(MockProvider::new().with_stream(&["4"]));
        let client = Arc::new(MockToolClient::new());
        let agent = agent(provider.clone(), client, ToolCatalog::default()).await;
        let mut session = session();
        let mut recorder = Recorder::default();

        let outcome = agent
            .run_turn(&mut session, "what is 2+2", &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(outcome.text(), "4");
        assert!(outcome.is_completed());
        assert_eq!(
            recorder.states,
            vec![TurnState::DetectingIntent, TurnState::StreamingReply, TurnState::Idle]
        );

        let sent = provider.stream_requests();
        assert_eq!(sent.len(), 1);
        let messages = &sent[0].messages;
        let n = messages.len();
        assert_eq!(messages[n - 3].role, Role::System);
        assert_eq!(messages[n - 3].content, "");
        assert_eq!(messages[n - 1].role, Role::User);
        assert_eq!(messages[n - 1].content, "what is 2+2");
    }

    #[tokio::test]
    async fn test_tool_output_reaches_chat_phase() {
        let provider = Arc::new(
            MockProvider::new()
                .with_tool_calls(&[("search", r#"{"query":"dragons"}"#)])
                .with_stream(&["Indeed", ", dragons."]),
        );
        let client = Arc::new(
            MockToolClient::new().with_response("search", Ok(ToolOutput::text("Dragons are mythical."))),
        );
        let agent = agent(provider.clone(), client.clone(), search_catalog()).await;
        let mut session = session();
        let mut recorder = Recorder::default();

        let outcome = agent
            .run_turn(&mut session, "tell me about dragons", &mut recorder, &CancellationToken::new())
            .await;

        assert_eq!(outcome.text(), "Indeed, dragons.");
        assert_eq!(recorder.detected[0].arguments.get("query"), Some(&json!("dragons")));
        assert_eq!(client.call_arguments()[0].get("query"), Some(&json!("dragons")));
        assert_eq!(
            recorder.states,
            vec![
                TurnState::DetectingIntent,
                TurnState::ExecutingTools,
                TurnState::StreamingReply,
                TurnState::Idle
            ]
        );

        let messages = &provider.stream_requests()[0].messages;
        let n = messages.len();
        assert_eq!(messages[n - 3].content, "Dragons are mythical.\n");
        assert_eq!(messages[n - 2].content, CHAT_DIRECTIVE);
        assert_eq!(messages[n - 1].content, "tell me about dragons");
    }

    #[tokio::test]
    async fn test_detection_failure_is_soft() {
        let provider = Arc::new(
            MockProvider::new()
                .with_completion(Err(AgentError::Connectivity("model runner down".into())))
                .with_stream(&["Still here."]),
        );
        let client = Arc::new(MockToolClient::new());
        let agent = agent(provider.clone(), client.clone(), search_catalog()).await;
        let mut session = session();
        let mut recorder = Recorder::default();

        let outcome = agent
            .run_turn(&mut session, "search dragons", &mut recorder, &CancellationToken::new())
            .await;

        assert!(outcome.is_completed());
        assert_eq!(recorder.diagnostics.len(), 1);
        assert_eq!(recorder.detection_failures, 1);
        assert!(client.calls().is_empty());
        let messages = &provider.stream_requests()[0].messages;
        assert_eq!(messages[messages.len() - 3].content, "");
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_partial_output() {
        let provider = Arc::new(MockProvider::new().with_stream_items(vec![
            Ok(StreamChunk::text("The cave")),
            Err(AgentError::StreamInterrupted("reset".into())),
        ]));
        let agent = agent(provider, Arc::new(MockToolClient::new()), ToolCatalog::default()).await;
        let mut session = session();
        let mut recorder = Recorder::default();

        let outcome = agent
            .run_turn(&mut session, "describe the cave", &mut recorder, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(outcome.text(), "The cave");
        assert_eq!(recorder.fragments, vec!["The cave"]);
        assert_eq!(recorder.diagnostics.len(), 1);
        assert_eq!(recorder.states.last(), Some(&TurnState::Idle));
    }

    #[tokio::test]
    async fn test_interruption_keeps_fragments_and_appends_nothing() {
        let provider = Arc::new(MockProvider::new().with_stalled_stream(&["The dragon", " roars"]));
        let agent = AgentBuilder::new()
            .provider(provider)
            .tool_client(Arc::new(MockToolClient::new()))
            .catalog(ToolCatalog::default())
            .config(AgentConfig {
                remember_replies: true,
                ..AgentConfig::new("tools-model", "chat-model")
            })
            .build()
            .await
            .unwrap();
        let mut session = session();
        let before = session.chat().len();

        struct Interrupter {
            fragments: Vec<String>,
            cancel: CancellationToken,
        }
        impl TurnObserver for Interrupter {
            fn on_fragment(&mut self, fragment: &str) {
                self.fragments.push(fragment.to_string());
                if self.fragments.len() == 2 {
                    self.cancel.cancel();
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut observer = Interrupter {
            fragments: Vec::new(),
            cancel: cancel.clone(),
        };

        let outcome = agent.run_turn(&mut session, "a story", &mut observer, &cancel).await;

        assert!(matches!(outcome, TurnOutcome::Interrupted { .. }));
        assert_eq!(outcome.text(), "The dragon roars");
        assert_eq!(observer.fragments, vec!["The dragon", " roars"]);
        // tool text, directive and utterance only: no assistant message
        assert_eq!(session.chat().len(), before + 3);
        assert!(session.chat().messages().iter().all(|m| m.role != Role::Assistant));
    }

    #[tokio::test]
    async fn test_cancel_before_reply_sends_no_chat_request() {
        let provider = Arc::new(
            MockProvider::new()
                .with_tool_calls(&[("search", r#"{"query":"dragons"}"#)])
                .with_stream(&["never sent"]),
        );
        let client = Arc::new(
            MockToolClient::new().with_response("search", Ok(ToolOutput::text("Dragons are mythical."))),
        );
        let agent = agent(provider.clone(), client.clone(), search_catalog()).await;
        let mut session = session();
        let before = session.chat().len();
        let mut recorder = Recorder::default();

        // Ctrl+C landed while tools were still being detected or run
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = agent.run_turn(&mut session, "are dragons real?", &mut recorder, &cancel).await;

        assert!(matches!(outcome, TurnOutcome::Interrupted { .. }));
        assert_eq!(outcome.text(), "");
        assert!(recorder.interrupted);
        assert_eq!(client.calls(), vec!["search"]);
        assert_eq!(provider.complete_requests().len(), 1);
        assert!(provider.stream_requests().is_empty());
        assert_eq!(session.chat().len(), before);
        assert_eq!(recorder.states.last(), Some(&TurnState::Idle));
    }

    #[tokio::test]
    async fn test_replies_are_forgotten_by_default() {
        let provider = Arc::new(MockProvider::new().with_stream(&["One"]).with_stream(&["Two"]));
        let agent = agent(provider.clone(), Arc::new(MockToolClient::new()), ToolCatalog::default()).await;
        let mut session = session();

        for utterance in ["first", "second"] {
            agent
                .run_turn(&mut session, utterance, &mut crate::turn::NoopObserver, &CancellationToken::new())
                .await;
        }

        let second = &provider.stream_requests()[1].messages;
        // persona (2) + two turns of three messages each
        assert_eq!(second.len(), 8);
        assert!(second.iter().all(|m| m.role != Role::Assistant));
        assert_eq!(session.turns(), 2);
    }

    #[tokio::test]
    async fn test_replies_remembered_when_enabled() {
        let provider = Arc::new(MockProvider::new().with_stream(&["Aye."]));
        let agent = AgentBuilder::new()
            .provider(provider)
            .tool_client(Arc::new(MockToolClient::new()))
            .catalog(ToolCatalog::default())
            .config(AgentConfig {
                remember_replies: true,
                ..AgentConfig::new("tools-model", "chat-model")
            })
            .build()
            .await
            .unwrap();
        let mut session = session();

        agent
            .run_turn(&mut session, "hail", &mut crate::turn::NoopObserver, &CancellationToken::new())
            .await;

        let last = session.chat().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Aye.");
    }

    #[tokio::test]
    async fn test_builder_fetches_catalog() {
        let client = Arc::new(MockToolClient::new().with_page(vec![ToolDefinition::new("search", "")]));
        let agent = AgentBuilder::new()
            .provider(Arc::new(MockProvider::new()))
            .tool_client(client.clone())
            .config(AgentConfig::new("tools-model", "chat-model"))
            .build()
            .await
            .unwrap();

        assert!(agent.catalog().contains("search"));
        assert_eq!(client.initialize_count(), 1);
    }

    #[tokio::test]
    async fn test_builder_requires_provider() {
        let result = AgentBuilder::new()
            .tool_client(Arc::new(MockToolClient::new()))
            .config(AgentConfig::new("tools-model", "chat-model"))
            .build()
            .await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
