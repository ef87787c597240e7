//! OpenAI-compatible LLM Provider
//!
//! Implementation of `LlmProvider` for any `/chat/completions` endpoint:
//! Docker Model Runner, Ollama's `/v1`, vLLM, llama.cpp server, OpenAI.

use std::time::Duration;

use async_trait::async_trait;
use dm_agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionRequest, CompletionStream, DetectedToolCall, FinishReason, LlmProvider,
        StreamChunk, TokenUsage,
    },
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

use crate::sse::SseDecoder;

/// Provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Base URL, e.g. `http://localhost:12434/engines/v1`
    pub base_url: String,

    /// Bearer token; local runners accept an empty key
    pub api_key: String,

    /// Timeout for non-streaming requests, in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:12434/engines/v1".into(),
            api_key: String::new(),
            timeout_secs: 120,
        }
    }
}

/// OpenAI-compatible completion provider
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiCompatProvider {
    /// Create a provider for `base_url` with the default timeout
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::from_config(OpenAiConfig {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: OpenAiConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.config.api_key)
        }
    }

    /// Convert agent messages to API format
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect()
    }

    /// Request body for `/chat/completions`
    fn build_body(request: &CompletionRequest, stream: bool) -> Value {
        let options = &request.options;
        let mut body = json!({
            "model": options.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": options.temperature,
            "stream": stream,
        });

        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
            if let Some(parallel) = options.parallel_tool_calls {
                body["parallel_tool_calls"] = json!(parallel);
            }
        }

        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    async fn post(&self, body: &Value, stream: bool) -> Result<reqwest::Response> {
        let mut builder = self
            .authorize(self.client.post(self.endpoint("chat/completions")))
            .json(body);

        builder = if stream {
            builder.header("Accept", "text/event-stream")
        } else {
            builder.timeout(Duration::from_secs(self.config.timeout_secs))
        };

        let response = builder.send().await.map_err(network_error)?;
        check_status(response).await
    }

    /// Convert an API response into a completion
    fn convert_completion(response: ApiResponse) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Protocol("No choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| DetectedToolCall {
                id: tc.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: tc.function.name,
                arguments: match tc.function.arguments {
                    Value::String(encoded) => encoded,
                    Value::Null => String::new(),
                    other => other.to_string(),
                },
            })
            .collect();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_default(),
            tool_calls,
            usage: response.usage.map(Into::into),
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.authorize(self.client.get(self.endpoint("models"))).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!("Completion service health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = Self::build_body(request, false);
        debug!(model = %request.options.model, tools = request.tools.len(), "Sending completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("Failed to parse response: {e}")))?;

        Self::convert_completion(api_response)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let body = Self::build_body(request, true);
        debug!(model = %request.options.model, "Sending streaming request");

        let response = self.post(&body, true).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_stream(response, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .authorize(self.client.get(self.endpoint("models")))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send()
            .await
            .map_err(network_error)?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        Ok(body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn network_error(e: reqwest::Error) -> AgentError {
    AgentError::Connectivity(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "Completion service returned error");

    Err(match status.as_u16() {
        502..=504 => AgentError::Connectivity(format!("HTTP {status}: {body}")),
        _ => AgentError::Protocol(format!("HTTP {status}: {body}")),
    })
}

/// What one SSE `data:` payload means for the reply stream
#[derive(Debug, PartialEq)]
enum StreamAction {
    Emit(StreamChunk),
    Done,
    Ignore,
}

fn interpret_event(data: &str) -> Result<StreamAction> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamAction::Done);
    }

    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            return Ok(StreamAction::Ignore);
        }
    };

    if let Some(error) = parsed.error {
        return Err(AgentError::Protocol(error.message));
    }

    let delta = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();
    let usage = parsed.usage.map(TokenUsage::from);

    if delta.is_empty() && usage.is_none() {
        return Ok(StreamAction::Ignore);
    }

    Ok(StreamAction::Emit(StreamChunk {
        delta,
        done: false,
        usage,
    }))
}

/// Read the SSE body and forward chunks until `[DONE]`, an error, or the
/// receiver going away.
async fn pump_stream(response: reqwest::Response, tx: mpsc::Sender<Result<StreamChunk>>) {
    let mut bytes = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(next) = bytes.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(AgentError::StreamInterrupted(e.to_string()))).await;
                return;
            }
        };

        for event in decoder.push(&chunk) {
            match interpret_event(&event.data) {
                Ok(StreamAction::Emit(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                Ok(StreamAction::Done) => {
                    let _ = tx.send(Ok(StreamChunk::done())).await;
                    return;
                }
                Ok(StreamAction::Ignore) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    if let Some(event) = decoder.finish() {
        if let Ok(StreamAction::Emit(chunk)) = interpret_event(&event.data) {
            let _ = tx.send(Ok(chunk)).await;
        }
    }

    // Stream ended without [DONE]
    let _ = tx.send(Ok(StreamChunk::done())).await;
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    /// Normally a JSON-encoded string; some local runners send an object
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for TokenUsage {
    fn from(u: ApiUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
