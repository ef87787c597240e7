//! Tool System
//!
//! Tools live behind a remote registry. This module holds the catalog fetched
//! from it, the translation into the completion service's function-calling
//! schema, and the invocation client that normalizes call results.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Argument object passed to a tool
pub type ToolArguments = Map<String, Value>;

/// Registries sometimes send `null` where a field is optional
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Input schema as published by the registry
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    /// Property name -> JSON Schema type metadata
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: Map<String, Value>,

    /// Names of required properties
    #[serde(default, deserialize_with = "null_as_default")]
    pub required: Vec<String>,
}

/// Tool definition fetched from the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,

    /// Parameter schema
    #[serde(default, rename = "inputSchema", deserialize_with = "null_as_default")]
    pub input_schema: InputSchema,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::default(),
        }
    }

    /// Add a property to the input schema
    pub fn with_property(mut self, name: impl Into<String>, schema: Value, required: bool) -> Self {
        let name = name.into();
        if required {
            self.input_schema.required.push(name.clone());
        }
        self.input_schema.properties.insert(name, schema);
        self
    }
}

/// Function tool in the completion service's calling convention
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub tool_type: String,

    pub function: FunctionSpec,
}

/// Function name, description and JSON Schema parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Translate a registry definition into a function tool.
///
/// Name and description pass through verbatim; properties and required are
/// copied as-is under an `"object"` schema. Consistency between the two is
/// the registry's concern.
pub fn translate(definition: &ToolDefinition) -> FunctionTool {
    FunctionTool {
        tool_type: "function".into(),
        function: FunctionSpec {
            name: definition.name.clone(),
            description: definition.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": definition.input_schema.properties,
                "required": definition.input_schema.required,
            }),
        },
    }
}

/// Content element of a tool response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Text-bearing content
    Text { text: String },

    /// Images, audio, embedded resources... not consumed by the agent
    #[serde(other)]
    Other,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent::Text { text: text.into() }
    }
}

/// Raw response of a remote tool call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: Vec<ToolContent>,

    /// Registry flagged the call as failed
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    /// First text element. Non-text variants are skipped and any later text
    /// elements are ignored.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            ToolContent::Text { text } => Some(text.as_str()),
            ToolContent::Other => None,
        })
    }
}

/// Identity reported by the registry during the handshake
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (protocol {})",
            self.name, self.version, self.protocol_version
        )
    }
}

/// One page of `tools/list`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Remote tool registry protocol
///
/// Implement this for each transport. The agent only ever talks to the
/// registry through this interface.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Handshake identifying this client
    async fn initialize(&self) -> Result<ServerInfo>;

    /// List available tools, one page at a time
    async fn list_tools(&self, cursor: Option<&str>) -> Result<ToolPage>;

    /// Invoke a tool
    async fn call_tool(&self, name: &str, arguments: &ToolArguments) -> Result<ToolOutput>;
}

/// Tool call requested by the detection phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Tool identifier
    pub tool_name: String,

    /// Arguments as key-value pairs
    pub arguments: ToolArguments,

    /// Call ID assigned by the completion service
    #[serde(default)]
    pub call_id: Option<String>,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            call_id: None,
        }
    }

    /// Build from a detected call's JSON-encoded argument string.
    ///
    /// Malformed arguments degrade to an empty map; the call itself then
    /// fails against the tool's schema if the arguments mattered.
    pub fn from_encoded(tool_name: impl Into<String>, encoded: &str) -> Self {
        let tool_name = tool_name.into();
        let arguments = match decode_arguments(encoded) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %tool_name, error = %e, "Using empty arguments");
                ToolArguments::new()
            }
        };
        Self::new(tool_name, arguments)
    }

    pub fn with_call_id(mut self, id: impl Into<String>) -> Self {
        self.call_id = Some(id.into());
        self
    }
}

/// Decode a JSON-encoded argument string into an object map
pub fn decode_arguments(encoded: &str) -> Result<ToolArguments> {
    match serde_json::from_str::<Value>(encoded) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(AgentError::ArgumentDecode(format!(
            "expected a JSON object, got {}",
            other
        ))),
        Err(e) => Err(AgentError::ArgumentDecode(e.to_string())),
    }
}

/// Normalized result of one tool invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Tool that was called
    pub tool_name: String,

    /// Whether execution succeeded
    pub succeeded: bool,

    /// Text output, present iff `succeeded`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_output: Option<String>,

    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn success(tool_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            succeeded: true,
            text_output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            succeeded: false,
            text_output: None,
            error: Some(error.into()),
        }
    }
}

/// Tool catalog, fetched once per process
#[derive(Clone, Debug, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

impl ToolCatalog {
    /// Build a catalog from definitions, dropping unnamed and duplicate tools
    pub fn new(definitions: impl IntoIterator<Item = ToolDefinition>) -> Self {
        let mut seen = HashSet::new();
        let mut tools = Vec::new();

        for definition in definitions {
            if definition.name.is_empty() {
                warn!("Skipping tool with empty name");
                continue;
            }
            if !seen.insert(definition.name.clone()) {
                warn!(tool = %definition.name, "Skipping duplicate tool");
                continue;
            }
            tools.push(definition);
        }

        Self { tools }
    }

    /// Handshake with the registry and list every tool it exposes
    pub async fn fetch(client: &dyn ToolClient) -> Result<Self> {
        let server = client.initialize().await?;
        debug!(server = %server.name, version = %server.version, "Tool registry initialized");
        Self::list(client).await
    }

    /// List every tool of an already initialized registry, page by page
    pub async fn list(client: &dyn ToolClient) -> Result<Self> {
        let mut definitions = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = client.list_tools(cursor.as_deref()).await?;
            definitions.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(Self::new(definitions))
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }

    /// All tools in the completion service's calling convention
    pub fn function_tools(&self) -> Vec<FunctionTool> {
        self.tools.iter().map(translate).collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Number of tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Tool invocation client
///
/// One remote call per invocation, no retry. Every outcome is folded into a
/// [`ToolCallResult`].
#[derive(Clone)]
pub struct ToolInvoker {
    client: Arc<dyn ToolClient>,
}

impl ToolInvoker {
    pub fn new(client: Arc<dyn ToolClient>) -> Self {
        Self { client }
    }

    pub async fn invoke(&self, name: &str, arguments: &ToolArguments) -> ToolCallResult {
        let output = match self.client.call_tool(name, arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                return ToolCallResult::failure(name, e.to_string());
            }
        };

        if output.is_error {
            let detail = output.first_text().unwrap_or("tool reported an error");
            return ToolCallResult::failure(name, AgentError::ToolExecution(detail.into()).to_string());
        }

        match output.first_text() {
            Some(text) if !text.is_empty() => ToolCallResult::success(name, text),
            _ => {
                debug!(tool = %name, "Tool returned no text content");
                ToolCallResult::failure(name, "tool returned no text content")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockToolClient;
    use serde_json::json;

    fn search_tool() -> ToolDefinition {
        ToolDefinition::new("search", "Search the lore")
            .with_property("query", json!({"type": "string"}), true)
    }

    #[test]
    fn test_translate() {
        let tool = translate(&search_tool());
        assert_eq!(tool.tool_type, "function");
        assert_eq!(tool.function.name, "search");
        assert_eq!(tool.function.description, "Search the lore");
        assert_eq!(
            tool.function.parameters,
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
            })
        );
    }

    #[test]
    fn test_translate_passes_inconsistent_schema_through() {
        let mut definition = ToolDefinition::new("roll", "Roll dice");
        definition.input_schema.required.push("sides".into());

        let tool = translate(&definition);
        assert_eq!(tool.function.parameters["required"], json!(["sides"]));
        assert_eq!(tool.function.parameters["properties"], json!({}));
    }

    #[test]
    fn test_definition_deserializes_registry_shape() {
        let raw = json!({
            "name": "roll",
            "description": "Roll dice",
            "inputSchema": {
                "type": "object",
                "properties": {"sides": {"type": "integer"}},
                "required": ["sides"]
            }
        });
        let definition: ToolDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(definition.input_schema.required, vec!["sides".to_string()]);
        assert!(definition.input_schema.properties.contains_key("sides"));
    }

    #[test]
    fn test_page_tolerates_null_fields() {
        let raw = json!({
            "tools": [
                {
                    "name": "search",
                    "description": "Search the lore",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }
                },
                {
                    "name": "roll",
                    "description": null,
                    "inputSchema": {"type": "object", "properties": null, "required": null}
                },
                {"name": "ping", "inputSchema": null}
            ],
            "nextCursor": null
        });
        let page: ToolPage = serde_json::from_value(raw).unwrap();
        assert_eq!(page.tools.len(), 3);
        assert_eq!(page.tools[0], search_tool());
        assert_eq!(page.tools[1].description, "");
        assert!(page.tools[1].input_schema.properties.is_empty());
        assert!(page.tools[1].input_schema.required.is_empty());
        assert_eq!(page.tools[2].input_schema, InputSchema::default());
        assert!(page.next_cursor.is_none());

        let catalog = ToolCatalog::new(page.tools);
        assert_eq!(translate(catalog.get("roll").unwrap()).function.parameters["properties"], json!({}));

        let output: ToolOutput = serde_json::from_value(json!({"content": null})).unwrap();
        assert!(output.first_text().is_none());
    }

    #[test]
    fn test_decode_arguments() {
        let args = decode_arguments(r#"{"query":"dragons"}"#).unwrap();
        assert_eq!(args.get("query"), Some(&json!("dragons")));

        assert!(matches!(decode_arguments("{oops"), Err(AgentError::ArgumentDecode(_))));
        assert!(matches!(decode_arguments("[1, 2]"), Err(AgentError::ArgumentDecode(_))));
    }

    #[test]
    fn test_malformed_arguments_yield_empty_map() {
        let request = ToolCallRequest::from_encoded("search", "{\"query\": ");
        assert_eq!(request.tool_name, "search");
        assert!(request.arguments.is_empty());

        let request = ToolCallRequest::from_encoded("search", "");
        assert!(request.arguments.is_empty());
    }

    #[test]
    fn test_content_decoding() {
        let raw = json!({
            "content": [
                {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ]
        });
        let output: ToolOutput = serde_json::from_value(raw).unwrap();
        assert_eq!(output.content[0], ToolContent::Other);
        assert_eq!(output.first_text(), Some("first"));
        assert!(!output.is_error);
    }

    #[test]
    fn test_catalog_drops_duplicates_and_unnamed() {
        let catalog = ToolCatalog::new(vec![
            search_tool(),
            ToolDefinition::new("", "nameless"),
            ToolDefinition::new("search", "duplicate"),
        ]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("search").unwrap().description, "Search the lore");
        assert!(!catalog.contains("unknown"));
    }

    #[tokio::test]
    async fn test_catalog_fetch_follows_pages() {
        let client = MockToolClient::new()
            .with_page(vec![search_tool()])
            .with_page(vec![ToolDefinition::new("roll", "Roll dice")]);

        let catalog = ToolCatalog::fetch(&client).await.unwrap();
        assert_eq!(catalog.names(), vec!["search", "roll"]);
        assert_eq!(client.initialize_count(), 1);
        assert_eq!(catalog.function_tools().len(), 2);
    }

    #[tokio::test]
    async fn test_catalog_list_skips_handshake() {
        let client = MockToolClient::new().with_page(vec![search_tool()]);

        let server = client.initialize().await.unwrap();
        assert_eq!(server.to_string(), "mock-registry 0.0.0 (protocol 2025-03-26)");

        let catalog = ToolCatalog::list(&client).await.unwrap();
        assert_eq!(catalog.names(), vec!["search"]);
        assert_eq!(client.initialize_count(), 1);
    }

    #[tokio::test]
    async fn test_catalog_fetch_fails_when_unreachable() {
        let client = MockToolClient::new().unreachable();
        let err = ToolCatalog::fetch(&client).await.unwrap_err();
        assert!(matches!(err, AgentError::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let client = Arc::new(
            MockToolClient::new().with_response("search", Ok(ToolOutput::text("Dragons are mythical."))),
        );
        let invoker = ToolInvoker::new(client.clone());

        let result = invoker.invoke("search", &ToolArguments::new()).await;
        assert!(result.succeeded);
        assert_eq!(result.text_output.as_deref(), Some("Dragons are mythical."));
        assert_eq!(client.calls(), vec!["search".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_empty_content_is_failure() {
        let client = Arc::new(
            MockToolClient::new()
                .with_response("empty", Ok(ToolOutput::default()))
                .with_response("blank", Ok(ToolOutput::text("")))
                .with_response(
                    "image",
                    Ok(ToolOutput {
                        content: vec![ToolContent::Other],
                        is_error: false,
                    }),
                ),
        );
        let invoker = ToolInvoker::new(client);

        for name in ["empty", "blank", "image"] {
            let result = invoker.invoke(name, &ToolArguments::new()).await;
            assert!(!result.succeeded, "{name} should fail");
            assert!(result.text_output.is_none());
            assert!(result.error.is_some());
        }
    }

    #[tokio::test]
    async fn test_invoke_transport_and_registry_errors() {
        let client = Arc::new(
            MockToolClient::new()
                .with_response("down", Err(AgentError::Connectivity("connection refused".into())))
                .with_response(
                    "broken",
                    Ok(ToolOutput {
                        content: vec![ToolContent::text("bad dice")],
                        is_error: true,
                    }),
                ),
        );
        let invoker = ToolInvoker::new(client);

        let result = invoker.invoke("down", &ToolArguments::new()).await;
        assert!(!result.succeeded);
        assert!(result.error.unwrap().contains("connection refused"));

        let result = invoker.invoke("broken", &ToolArguments::new()).await;
        assert!(!result.succeeded);
        assert!(result.error.unwrap().contains("bad dice"));
    }
}
