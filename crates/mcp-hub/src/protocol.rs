//! JSON-RPC 2.0 envelopes and MCP payload types

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version sent during initialization
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> McpResult<Value> {
        serde_json::to_value(self).map_err(|e| McpError::SchemaMismatch(e.to_string()))
    }
}

/// Build a JSON-RPC notification (no id)
pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params }),
        None => serde_json::json!({ "jsonrpc": "2.0", "method": method }),
    }
}

/// Build a JSON-RPC error reply for a request the server sent us
pub fn error_reply(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Collapse the response into its result or a typed error
    pub fn into_outcome(self) -> McpResult<Value> {
        if let Some(error) = self.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A decoded message received from a server
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Reply to one of our requests
    Response { id: u64, outcome: McpResult<Value> },
    /// Request initiated by the server (sampling, roots, ...)
    Request { id: Value, method: String },
    /// Notification from the server
    Notification { method: String, params: Option<Value> },
}

impl IncomingMessage {
    /// Classify a raw JSON-RPC message
    ///
    /// Responses whose id is not one we could have issued yield `None`.
    pub fn classify(value: Value) -> McpResult<Option<Self>> {
        let Some(object) = value.as_object() else {
            return Err(McpError::MalformedFrame(
                "JSON-RPC message is not an object".to_string(),
            ));
        };

        if let Some(method) = object.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return Ok(Some(match object.get("id") {
                Some(id) if !id.is_null() => Self::Request {
                    id: id.clone(),
                    method,
                },
                _ => Self::Notification {
                    method,
                    params: object.get("params").cloned(),
                },
            }));
        }

        let id = match object.get("id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse::<u64>().ok(),
            _ => None,
        };
        let Some(id) = id else {
            return Ok(None);
        };

        let response: JsonRpcResponse = serde_json::from_value(value)
            .map_err(|e| McpError::MalformedFrame(format!("invalid JSON-RPC response: {}", e)))?;

        Ok(Some(Self::Response {
            id,
            outcome: response.into_outcome(),
        }))
    }
}

/// Client info for initialization
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcp-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server capabilities returned during initialization
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
    #[serde(default)]
    pub logging: Option<Value>,
}

/// Server info returned during initialization
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Initialize result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// MCP Tool definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Argument accepted by a prompt
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// MCP prompt definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpPromptInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    pub prompts: Vec<McpPromptInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One message of a rendered prompt
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// MCP Resource definition from server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    pub resources: Vec<McpResource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Resource content
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContent>,
}

/// Tool call result content
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub resource: Option<Value>,
}

/// Tool call result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub structured_content: Option<Value>,
}

/// Flattened result of a tool call, ready for the agent loop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    /// False when the server flagged the result as an error
    pub success: bool,
    /// Text content joined with newlines
    pub output: String,
    /// Structured content, when the server provided it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

impl From<CallToolResult> for ToolOutput {
    fn from(result: CallToolResult) -> Self {
        let mut output_parts = Vec::new();

        for content in &result.content {
            match content.content_type.as_str() {
                "text" => {
                    if let Some(text) = &content.text {
                        output_parts.push(text.clone());
                    }
                }
                "image" | "audio" => {
                    let mime = content.mime_type.as_deref().unwrap_or("binary");
                    output_parts.push(format!("[{} data: {}]", content.content_type, mime));
                }
                "resource" => {
                    let uri = content
                        .resource
                        .as_ref()
                        .and_then(|r| r.get("uri"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    output_parts.push(format!("[Resource: {}]", uri));
                }
                _ => {
                    if let Some(text) = &content.text {
                        output_parts.push(text.clone());
                    }
                }
            }
        }

        Self {
            success: !result.is_error,
            output: output_parts.join("\n"),
            structured: result.structured_content,
        }
    }
}

/// Deserialize a result payload into a typed struct
pub fn parse_result<T: for<'de> Deserialize<'de>>(method: &str, value: Value) -> McpResult<T> {
    serde_json::from_value(value)
        .map_err(|e| McpError::SchemaMismatch(format!("{} result: {}", method, e)))
}
