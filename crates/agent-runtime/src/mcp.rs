//! MCP Tool Registry Client
//!
//! `ToolClient` over the streamable HTTP transport: JSON-RPC 2.0 requests
//! POSTed to a single endpoint, answered either as `application/json` or as
//! a `text/event-stream` carrying the response event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dm_agent_core::{
    error::{AgentError, Result},
    tool::{ServerInfo, ToolArguments, ToolClient, ToolOutput, ToolPage},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::sse::decode_all;

/// Protocol revision requested during the handshake
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";

/// Registry connection settings
#[derive(Clone, Debug)]
pub struct McpConfig {
    /// Endpoint URL, e.g. `http://localhost:9011/mcp`
    pub url: String,

    /// Name announced in `clientInfo`
    pub client_name: String,

    /// Version announced in `clientInfo`
    pub client_version: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl McpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: "bob".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            timeout_secs: 120,
        }
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Negotiated after `initialize`
#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    protocol_version: Option<String>,
}

/// MCP client speaking the streamable HTTP transport
pub struct McpHttpClient {
    http: reqwest::Client,
    config: McpConfig,
    state: RwLock<SessionState>,
    next_id: AtomicU64,
}

impl McpHttpClient {
    pub fn new(config: McpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            state: RwLock::new(SessionState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Session id assigned by the registry, if any
    pub async fn session_id(&self) -> Option<String> {
        self.state.read().await.session_id.clone()
    }

    /// End the registry session. Servers that do not support explicit
    /// termination answer 405, which is fine.
    pub async fn close(&self) -> Result<()> {
        let Some(session_id) = self.state.write().await.session_id.take() else {
            return Ok(());
        };

        let response = self
            .http
            .delete(&self.config.url)
            .header(SESSION_HEADER, &session_id)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::METHOD_NOT_ALLOWED {
            warn!(status = status.as_u16(), "Registry refused session termination");
        }
        debug!(session = %session_id, "Registry session closed");
        Ok(())
    }

    async fn post(&self, message: &JsonRpcRequest<'_>) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.config.url)
            .header("Accept", "application/json, text/event-stream")
            .json(message);

        {
            let state = self.state.read().await;
            if let Some(session_id) = &state.session_id {
                builder = builder.header(SESSION_HEADER, session_id);
            }
            if let Some(version) = &state.protocol_version {
                builder = builder.header(PROTOCOL_HEADER, version);
            }
        }

        let response = builder.send().await.map_err(network_error)?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut state = self.state.write().await;
            if state.session_id.as_deref() != Some(session_id) {
                debug!(session = %session_id, "Registry assigned session");
                state.session_id = Some(session_id.to_string());
            }
        }

        check_status(response).await
    }

    /// Send a request and return its `result`
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "Registry request");

        let response = self
            .post(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: Some(id),
                method,
                params: Some(params),
            })
            .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await.map_err(network_error)?;

        let envelope = parse_envelope(&content_type, &body, id)?;
        if let Some(error) = envelope.error {
            return Err(AgentError::Protocol(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }

        envelope
            .result
            .ok_or_else(|| AgentError::Protocol(format!("{method} response has no result")))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.post(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ToolClient for McpHttpClient {
    async fn initialize(&self) -> Result<ServerInfo> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": self.config.client_name,
                        "version": self.config.client_version,
                    },
                }),
            )
            .await?;

        let handshake: InitializeResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("Invalid initialize result: {e}")))?;

        self.state.write().await.protocol_version = Some(handshake.protocol_version.clone());
        self.notify("notifications/initialized").await?;

        info!(
            server = %handshake.server_info.name,
            version = %handshake.server_info.version,
            protocol = %handshake.protocol_version,
            "Connected to tool registry"
        );

        Ok(ServerInfo {
            name: handshake.server_info.name,
            version: handshake.server_info.version,
            protocol_version: handshake.protocol_version,
        })
    }

    async fn list_tools(&self, cursor: Option<&str>) -> Result<ToolPage> {
        let params = cursor.map_or_else(|| json!({}), |cursor| json!({ "cursor": cursor }));
        let result = self.request("tools/list", params).await?;

        serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("Invalid tools/list result: {e}")))
    }

    async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> Result<ToolOutput> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;

        serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("Invalid tools/call result: {e}")))
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
    warn!(status = status.as_u16(), body = %body, "Tool registry returned error");

    Err(match status.as_u16() {
        502..=504 => AgentError::Connectivity(format!("HTTP {status}: {body}")),
        _ => AgentError::Protocol(format!("HTTP {status}: {body}")),
    })
}

/// Pick the response for `id` out of a JSON or event-stream body
fn parse_envelope(content_type: &str, body: &str, id: u64) -> Result<JsonRpcResponse> {
    if content_type.starts_with("text/event-stream") {
        return decode_all(body)
            .into_iter()
            .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(&event.data).ok())
            .find(|response| response.answers(id))
            .ok_or_else(|| {
                AgentError::Protocol(format!("No response to request {id} in event stream"))
            });
    }

    let response: JsonRpcResponse = serde_json::from_str(body)
        .map_err(|e| AgentError::Protocol(format!("Invalid JSON-RPC response: {e}")))?;
    if !response.answers(id) {
        warn!(expected = id, got = ?response.id, "JSON-RPC response id mismatch");
    }
    Ok(response)
}

// --- JSON-RPC types (internal) ---

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn answers(&self, id: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: String,
    #[serde(default)]
    server_info: ImplementationInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ImplementationInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_agent_core::tool::{ToolCatalog, ToolContent};
    use mockito::Matcher;

    fn client(server: &mockito::ServerGuard) -> McpHttpClient {
        McpHttpClient::new(McpConfig::new(format!("{}/mcp", server.url()))).unwrap()
    }

    fn rpc_result(id: u64, result: Value) -> String {
        json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
    }

    #[test]
    fn test_parse_json_envelope() {
        let envelope = parse_envelope(
            "application/json",
            &rpc_result(3, json!({"tools": []})),
            3,
        )
        .unwrap();
        assert!(envelope.error.is_none());
        assert_eq!(envelope.result.unwrap(), json!({"tools": []}));
    }

    #[test]
    fn test_parse_event_stream_envelope_skips_other_messages() {
        let body = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            rpc_result(7, json!({"content": []})),
        );
        let envelope = parse_envelope("text/event-stream", &body, 7).unwrap();
        assert_eq!(envelope.result.unwrap(), json!({"content": []}));

        let err = parse_envelope("text/event-stream", &body, 8).unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let err = parse_envelope("application/json", "<html>", 1).unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({
                "method": "initialize",
                "params": {"protocolVersion": PROTOCOL_VERSION, "clientInfo": {"name": "bob"}}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header(SESSION_HEADER, "session-42")
            .with_body(rpc_result(
                1,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "lore-server", "version": "0.3.0"}
                }),
            ))
            .create_async()
            .await;
        let initialized = server
            .mock("POST", "/mcp")
            .match_header(SESSION_HEADER, "session-42")
            .match_header(PROTOCOL_HEADER, PROTOCOL_VERSION)
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .with_status(202)
            .create_async()
            .await;

        let client = client(&server);
        let info = client.initialize().await.unwrap();

        init.assert_async().await;
        initialized.assert_async().await;
        assert_eq!(info.name, "lore-server");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(client.session_id().await.as_deref(), Some("session-42"));
    }

    #[tokio::test]
    async fn test_list_tools_over_event_stream() {
        let mut server = mockito::Server::new_async().await;
        let body = format!(
            "event: message\ndata: {}\n\n",
            rpc_result(
                1,
                json!({
                    "tools": [{
                        "name": "search",
                        "description": "Search the lore",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"query": {"type": "string"}},
                            "required": ["query"]
                        }
                    }],
                    "nextCursor": "page-2"
                })
            )
        );
        let mock = server
            .mock("POST", "/mcp")
            .match_header("accept", "application/json, text/event-stream")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/list",
                "params": {"cursor": "page-1"}
            })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let page = client(&server).list_tools(Some("page-1")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.tools[0].name, "search");
        assert_eq!(page.tools[0].input_schema.required, vec!["query".to_string()]);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn test_call_tool() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({
                "method": "tools/call",
                "params": {"name": "search", "arguments": {"query": "dragons"}}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_result(
                1,
                json!({"content": [{"type": "text", "text": "Dragons are mythical."}]}),
            ))
            .create_async()
            .await;

        let mut arguments = ToolArguments::new();
        arguments.insert("query".into(), json!("dragons"));
        let output = client(&server).call_tool("search", &arguments).await.unwrap();

        mock.assert_async().await;
        assert!(!output.is_error);
        assert_eq!(output.content, vec![ToolContent::text("Dragons are mythical.")]);
    }

    #[tokio::test]
    async fn test_rpc_error_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0", "id": 1,
                    "error": {"code": -32602, "message": "Unknown tool: teleport"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let err = client(&server)
            .call_tool("teleport", &ToolArguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Protocol(msg) if msg.contains("Unknown tool: teleport")));
    }

    #[tokio::test]
    async fn test_catalog_fetch_over_http() {
        let mut server = mockito::Server::new_async().await;
        let _init = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_result(
                1,
                json!({"protocolVersion": PROTOCOL_VERSION, "serverInfo": {"name": "lore", "version": "1"}}),
            ))
            .create_async()
            .await;
        let _initialized = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .with_status(202)
            .create_async()
            .await;
        let _list = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(rpc_result(
                2,
                json!({"tools": [{"name": "search"}, {"name": "roll_dice", "description": "Roll"}]}),
            ))
            .create_async()
            .await;

        let client = client(&server);
        let catalog = ToolCatalog::fetch(&client).await.unwrap();

        assert_eq!(catalog.names(), vec!["search", "roll_dice"]);
    }

    #[tokio::test]
    async fn test_unreachable_registry() {
        let client = McpHttpClient::new(McpConfig::new("http://127.0.0.1:9/mcp")).unwrap();
        let err = client.initialize().await.unwrap_err();
        assert!(matches!(err, AgentError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let client = McpHttpClient::new(McpConfig::new("http://127.0.0.1:9/mcp")).unwrap();
        client.close().await.unwrap();
    }
}
