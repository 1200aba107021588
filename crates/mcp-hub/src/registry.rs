//! Registry of discovered tools, prompts and resources

use crate::error::McpResult;
use crate::ids::{ServerName, ToolName};
use crate::protocol::{McpPromptInfo, McpResource, McpToolInfo, PromptArgument};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// A tool discovered on a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRecord {
    pub server: ServerName,
    pub name: ToolName,
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolRecord {
    pub fn from_info(server: &ServerName, info: McpToolInfo) -> McpResult<Self> {
        Ok(Self {
            server: server.clone(),
            name: ToolName::new(info.name)?,
            description: info.description,
            input_schema: info.input_schema,
            output_schema: info.output_schema,
        })
    }

    /// `server/tool`
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server, self.name)
    }
}

/// A prompt discovered on a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRecord {
    pub server: ServerName,
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

impl PromptRecord {
    pub fn from_info(server: &ServerName, info: McpPromptInfo) -> Self {
        Self {
            server: server.clone(),
            name: info.name,
            description: info.description,
            arguments: info.arguments,
        }
    }
}

/// A resource advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRecord {
    pub server: ServerName,
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

impl ResourceRecord {
    pub fn from_info(server: &ServerName, info: McpResource) -> Self {
        Self {
            server: server.clone(),
            uri: info.uri,
            name: info.name,
            description: info.description,
            mime_type: info.mime_type,
        }
    }
}

type ToolKey = (ServerName, ToolName);

/// Merged capability view across all servers
///
/// Tools are keyed by `(server, tool)`; enumeration follows registration
/// order. When two servers expose the same bare name, the one registered
/// first wins bare lookups and the other stays reachable qualified.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    tools: HashMap<ToolKey, ToolRecord>,
    order: Vec<ToolKey>,
    prompts: Vec<PromptRecord>,
    resources: Vec<ResourceRecord>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything registered for `server`
    pub fn register_server(
        &mut self,
        server: &ServerName,
        tools: Vec<ToolRecord>,
        prompts: Vec<PromptRecord>,
        resources: Vec<ResourceRecord>,
    ) -> Vec<ToolName> {
        self.purge_server(server);

        let mut names = Vec::with_capacity(tools.len());
        for record in tools {
            let key = (server.clone(), record.name.clone());
            if self.tools.insert(key.clone(), record).is_none() {
                names.push(key.1.clone());
                self.order.push(key);
            }
        }
        self.prompts.extend(prompts);
        self.resources.extend(resources);
        names
    }

    /// Drop every record owned by `server`; returns the number of tools removed
    pub fn purge_server(&mut self, server: &ServerName) -> usize {
        let before = self.tools.len();
        self.tools.retain(|(owner, _), _| owner != server);
        self.order.retain(|(owner, _)| owner != server);
        self.prompts.retain(|p| &p.server != server);
        self.resources.retain(|r| &r.server != server);
        before - self.tools.len()
    }

    /// Resolve a bare or qualified (`server/tool`, `server__tool`) reference
    pub fn resolve_tool(&self, name: &ToolName) -> Option<&ToolRecord> {
        let bare = self
            .order
            .iter()
            .find(|(_, tool)| tool == name)
            .and_then(|key| self.tools.get(key));
        if bare.is_some() {
            return bare;
        }

        let (server, tool) = name.split_qualified()?;
        self.tools.get(&(server, tool))
    }

    /// Find a prompt by bare or `server/prompt` name
    pub fn find_prompt(&self, name: &str) -> Option<&PromptRecord> {
        if let Some(prompt) = self.prompts.iter().find(|p| p.name == name) {
            return Some(prompt);
        }
        let (server, prompt) = name.split_once('/')?;
        self.prompts
            .iter()
            .find(|p| p.server.as_str() == server && p.name == prompt)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolRecord> {
        self.order.iter().filter_map(|key| self.tools.get(key))
    }

    pub fn tools_for<'a>(&'a self, server: &'a ServerName) -> impl Iterator<Item = &'a ToolRecord> {
        self.tools().filter(move |t| &t.server == server)
    }

    pub fn prompts(&self) -> &[PromptRecord] {
        &self.prompts
    }

    pub fn resources(&self) -> &[ResourceRecord] {
        &self.resources
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty() && self.resources.is_empty()
    }
}
