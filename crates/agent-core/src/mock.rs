//! Mock Provider and Tool Registry
//!
//! Scripted doubles for the two remote services. They record every call so
//! tests can assert on ordering and on the exact requests that were built.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{AgentError, Result};
use crate::provider::{
    Completion, CompletionRequest, CompletionStream, DetectedToolCall, LlmProvider, StreamChunk,
};
use crate::tool::{ServerInfo, ToolArguments, ToolClient, ToolDefinition, ToolOutput, ToolPage};

/// How a scripted stream behaves
enum StreamScript {
    /// Yield the items, then end
    Items(Vec<Result<StreamChunk>>),
    /// Yield the items, then never finish
    ItemsThenHang(Vec<Result<StreamChunk>>),
    /// Fail before the stream opens
    Refuse(AgentError),
}

/// Mock completion service
#[derive(Default)]
pub struct MockProvider {
    completions: Mutex<VecDeque<Result<Completion>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    complete_requests: Mutex<Vec<CompletionRequest>>,
    stream_requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completion answering with the given tool calls
    pub fn with_tool_calls(self, calls: &[(&str, &str)]) -> Self {
        let tool_calls = calls
            .iter()
            .enumerate()
            .map(|(i, (name, arguments))| DetectedToolCall {
                id: format!("call_{i}"),
                name: (*name).to_string(),
                arguments: (*arguments).to_string(),
            })
            .collect();

        self.with_completion(Ok(Completion {
            model: "mock".into(),
            tool_calls,
            ..Default::default()
        }))
    }

    /// Queue a raw completion result
    pub fn with_completion(self, completion: Result<Completion>) -> Self {
        self.completions.lock().unwrap().push_back(completion);
        self
    }

    /// Queue a stream yielding the given fragments
    pub fn with_stream(self, fragments: &[&str]) -> Self {
        let mut items: Vec<Result<StreamChunk>> =
            fragments.iter().map(|f| Ok(StreamChunk::text(*f))).collect();
        items.push(Ok(StreamChunk::done()));
        self.push_stream(StreamScript::Items(items))
    }

    /// Queue a stream with arbitrary items (errors included)
    pub fn with_stream_items(self, items: Vec<Result<StreamChunk>>) -> Self {
        self.push_stream(StreamScript::Items(items))
    }

    /// Queue a stream that yields the fragments and then stalls
    pub fn with_stalled_stream(self, fragments: &[&str]) -> Self {
        let items = fragments.iter().map(|f| Ok(StreamChunk::text(*f))).collect();
        self.push_stream(StreamScript::ItemsThenHang(items))
    }

    /// Queue a stream that cannot be opened
    pub fn with_refused_stream(self, error: AgentError) -> Self {
        self.push_stream(StreamScript::Refuse(error))
    }

    fn push_stream(self, script: StreamScript) -> Self {
        self.streams.lock().unwrap().push_back(script);
        self
    }

    /// Requests sent through `complete`
    pub fn complete_requests(&self) -> Vec<CompletionRequest> {
        self.complete_requests.lock().unwrap().clone()
    }

    /// Requests sent through `complete_stream`
    pub fn stream_requests(&self) -> Vec<CompletionRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    /// Total number of completion calls of either kind
    pub fn call_count(&self) -> usize {
        self.complete_requests.lock().unwrap().len() + self.stream_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.complete_requests.lock().unwrap().push(request.clone());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::default()))
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        self.stream_requests.lock().unwrap().push(request.clone());
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StreamScript::Items(vec![Ok(StreamChunk::done())]));

        match script {
            StreamScript::Items(items) => Ok(Box::pin(futures::stream::iter(items))),
            StreamScript::ItemsThenHang(items) => Ok(Box::pin(
                futures::stream::iter(items).chain(futures::stream::pending()),
            )),
            StreamScript::Refuse(error) => Err(error),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mock".into()])
    }
}

/// Mock tool registry
#[derive(Default)]
pub struct MockToolClient {
    pages: Vec<Vec<ToolDefinition>>,
    responses: Mutex<HashMap<String, VecDeque<Result<ToolOutput>>>>,
    delays: HashMap<String, Duration>,
    unreachable: bool,
    calls: Mutex<Vec<(String, ToolArguments)>>,
    initialized: AtomicUsize,
}

impl MockToolClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `tools/list` page
    pub fn with_page(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.pages.push(tools);
        self
    }

    /// Queue the response for the next call of `name`
    pub fn with_response(self, name: &str, response: Result<ToolOutput>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Delay every call of `name`
    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    /// Fail the handshake and listing with a connectivity error
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Tool names in invocation order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Arguments of every invocation, in order
    pub fn call_arguments(&self) -> Vec<ToolArguments> {
        self.calls.lock().unwrap().iter().map(|(_, args)| args.clone()).collect()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolClient for MockToolClient {
    async fn initialize(&self) -> Result<ServerInfo> {
        if self.unreachable {
            return Err(AgentError::Connectivity("mock registry is unreachable".into()));
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(ServerInfo {
            name: "mock-registry".into(),
            version: "0.0.0".into(),
            protocol_version: "2025-03-26".into(),
        })
    }

    async fn list_tools(&self, cursor: Option<&str>) -> Result<ToolPage> {
        if self.unreachable {
            return Err(AgentError::Connectivity("mock registry is unreachable".into()));
        }
        let index = cursor
            .and_then(|c| c.strip_prefix("page-"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);

        let next_cursor = (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1));

        Ok(ToolPage {
            tools: self.pages.get(index).cloned().unwrap_or_default(),
            next_cursor,
        })
    }

    async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));

        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(AgentError::Protocol(format!("no scripted response for {name}"))))
    }
}
