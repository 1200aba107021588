//! MCP client operations
//!
//! Implements the Model Context Protocol requests on top of a [`Transport`].
//! The client borrows the transport; it does not own or serialize access to
//! it (that is the connection's job).

use crate::error::{McpError, McpResult, METHOD_NOT_FOUND};
use crate::protocol::{
    parse_result, CallToolResult, ClientInfo, GetPromptResult, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, McpPromptInfo, McpResource,
    McpToolInfo, ReadResourceResult, MCP_PROTOCOL_VERSION,
};
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on pages fetched by one list call
const MAX_LIST_PAGES: usize = 100;

/// Everything learned from a server during connection setup
#[derive(Debug, Clone)]
pub struct Discovery {
    pub init: InitializeResult,
    pub tools: Vec<McpToolInfo>,
    pub prompts: Vec<McpPromptInfo>,
    pub resources: Vec<McpResource>,
}

/// MCP Client
pub struct McpClient<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
}

impl<'a> McpClient<'a> {
    pub fn new(transport: &'a dyn Transport, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> McpResult<T> {
        let value = self.transport.request(method, params, self.timeout).await?;
        parse_result(method, value)
    }

    /// Initialize the connection with the MCP server
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": ClientInfo::default()
        });

        let result: InitializeResult = self.request("initialize", Some(params)).await?;

        if result.protocol_version != MCP_PROTOCOL_VERSION {
            debug!(
                server = %result.server_info.name,
                version = %result.protocol_version,
                "MCP server negotiated a different protocol version"
            );
        }

        self.transport.on_initialized(&result);
        self.transport
            .notify("notifications/initialized", None)
            .await?;

        Ok(result)
    }

    /// Fetch every page of a list method
    ///
    /// Servers without the method yield an empty list.
    async fn list_all<P, T>(
        &self,
        method: &str,
        extract: impl Fn(P) -> (Vec<T>, Option<String>),
    ) -> McpResult<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));

            let page: P = match self.request(method, params).await {
                Ok(page) => page,
                Err(McpError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                    debug!(method, "MCP server does not implement list method");
                    return Ok(items);
                }
                Err(e) => return Err(e),
            };

            let (page_items, next_cursor) = extract(page);
            items.extend(page_items);

            match next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        warn!(method, pages = MAX_LIST_PAGES, "Stopped paginating MCP list");
        Ok(items)
    }

    /// List available tools
    pub async fn list_tools(&self) -> McpResult<Vec<McpToolInfo>> {
        self.list_all("tools/list", |page: ListToolsResult| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    /// List available prompts
    pub async fn list_prompts(&self) -> McpResult<Vec<McpPromptInfo>> {
        self.list_all("prompts/list", |page: ListPromptsResult| {
            (page.prompts, page.next_cursor)
        })
        .await
    }

    /// List available resources
    pub async fn list_resources(&self) -> McpResult<Vec<McpResource>> {
        self.list_all("resources/list", |page: ListResourcesResult| {
            (page.resources, page.next_cursor)
        })
        .await
    }

    /// Handshake followed by capability discovery
    pub async fn discover(&self) -> McpResult<Discovery> {
        let init = self.initialize().await?;
        let caps = &init.capabilities;

        let tools = if caps.tools.is_some() {
            self.list_tools().await?
        } else {
            Vec::new()
        };
        let prompts = if caps.prompts.is_some() {
            self.list_prompts().await?
        } else {
            Vec::new()
        };
        let resources = if caps.resources.is_some() {
            self.list_resources().await?
        } else {
            Vec::new()
        };

        Ok(Discovery {
            init,
            tools,
            prompts,
            resources,
        })
    }

    /// Call a tool
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let params = json!({
            "name": name,
            "arguments": arguments
        });

        self.request("tools/call", Some(params)).await
    }

    /// Render a prompt
    pub async fn get_prompt(&self, name: &str, arguments: Map<String, Value>) -> McpResult<GetPromptResult> {
        let params = json!({
            "name": name,
            "arguments": arguments
        });

        self.request("prompts/get", Some(params)).await
    }

    /// Read a resource by URI
    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    /// Ping the server
    pub async fn ping(&self) -> McpResult<()> {
        let _: Value = self.request("ping", None).await?;
        Ok(())
    }
}
