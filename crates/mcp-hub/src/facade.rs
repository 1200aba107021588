//! Error-raising adapter over [`McpManager`]
//!
//! Callers written against the older API pass plain strings and expect
//! `anyhow` errors. This wrapper re-validates every name, forwards to the
//! core and attaches context while keeping the [`McpError`] as the source,
//! so `err.downcast_ref::<McpError>()` still works.

use crate::config::{McpConfig, ServerConfig};
use crate::connection::ServerStatus;
use crate::error::McpError;
use crate::events::{EventKind, McpEvent, SubscriptionId};
use crate::ids::{ServerName, ToolName};
use crate::manager::{InitReport, McpManager, ReconcileReport, ShutdownReport};
use crate::protocol::{GetPromptResult, ReadResourceResult, ToolOutput};
use crate::registry::{PromptRecord, ResourceRecord, ToolRecord};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

/// Handle for a handler registered through [`LegacyMcpManager::on`]
pub type HandlerId = SubscriptionId;

fn core_error(err: McpError, context: String) -> anyhow::Error {
    anyhow::Error::new(err).context(context)
}

/// String-keyed, `anyhow`-returning view of an [`McpManager`]
pub struct LegacyMcpManager {
    manager: McpManager,
    /// `None` once disposed
    handlers: Mutex<Option<HashSet<HandlerId>>>,
}

impl LegacyMcpManager {
    pub fn new(manager: McpManager) -> Self {
        Self {
            manager,
            handlers: Mutex::new(Some(HashSet::new())),
        }
    }

    /// Build a manager from `config` with every server configured
    pub fn from_config(config: &McpConfig) -> Result<Self> {
        let manager = McpManager::from_config(config)
            .map_err(|e| core_error(e, "Failed to configure MCP servers".to_string()))?;
        Ok(Self::new(manager))
    }

    /// Underlying typed manager
    pub fn manager(&self) -> &McpManager {
        &self.manager
    }

    fn check_open(&self) -> Result<()> {
        if self.handlers.lock().is_none() {
            bail!("MCP facade disposed");
        }
        Ok(())
    }

    fn server_name(name: &str) -> Result<ServerName> {
        ServerName::new(name).map_err(|e| core_error(e, format!("Invalid MCP server name: {}", name)))
    }

    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        self.check_open()?;
        let name = config.name.clone();
        self.manager
            .add_server(config)
            .await
            .map_err(|e| core_error(e, format!("Failed to add MCP server '{}'", name)))
    }

    pub async fn remove_server(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let server = Self::server_name(name)?;
        self.manager
            .remove_server(&server)
            .await
            .map_err(|e| core_error(e, format!("Failed to remove MCP server '{}'", name)))
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        self.check_open()?;
        let tool_name = ToolName::new(tool)
            .map_err(|e| core_error(e, format!("Invalid MCP tool name: {}", tool)))?;
        self.manager
            .call_tool(&tool_name, arguments)
            .await
            .map_err(|e| core_error(e, format!("MCP tool call '{}' failed", tool)))
    }

    pub fn get_tools(&self) -> Result<Vec<ToolRecord>> {
        self.check_open()?;
        Ok(self.manager.get_tools())
    }

    pub fn get_servers(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .manager
            .get_servers()
            .into_iter()
            .map(|name| name.to_string())
            .collect())
    }

    pub fn get_prompts(&self) -> Result<Vec<PromptRecord>> {
        self.check_open()?;
        Ok(self.manager.get_prompts())
    }

    pub fn get_resources(&self) -> Result<Vec<ResourceRecord>> {
        self.check_open()?;
        Ok(self.manager.get_resources())
    }

    pub fn get_connection_status(&self) -> Result<Vec<ServerStatus>> {
        self.check_open()?;
        Ok(self.manager.get_connection_status())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Map<String, Value>) -> Result<GetPromptResult> {
        self.check_open()?;
        self.manager
            .get_prompt(name, arguments)
            .await
            .map_err(|e| core_error(e, format!("Failed to get MCP prompt '{}'", name)))
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult> {
        self.check_open()?;
        let server_name = Self::server_name(server)?;
        self.manager
            .read_resource(&server_name, uri)
            .await
            .map_err(|e| core_error(e, format!("Failed to read '{}' from MCP server '{}'", uri, server)))
    }

    pub fn reset_token_usage(&self, server: &str) -> Result<()> {
        self.check_open()?;
        let server_name = Self::server_name(server)?;
        self.manager
            .reset_token_usage(&server_name)
            .map_err(|e| core_error(e, format!("Failed to reset token usage for '{}'", server)))
    }

    /// Connect every configured server
    ///
    /// Fails only when no enabled server could be connected at all.
    pub async fn ensure_servers_initialized(&self) -> Result<InitReport> {
        self.check_open()?;
        let report = self
            .manager
            .ensure_servers_initialized()
            .await
            .map_err(|e| core_error(e, "Failed to initialize MCP servers".to_string()))?;

        if report.connected.is_empty() {
            if let Some((server, err)) = report.failed.first() {
                return Err(core_error(
                    err.clone(),
                    format!("No MCP server could be initialized (first failure: '{}')", server),
                ));
            }
        }
        Ok(report)
    }

    pub async fn reconcile(&self, configs: Vec<ServerConfig>) -> Result<ReconcileReport> {
        self.check_open()?;
        self.manager
            .reconcile(configs)
            .await
            .map_err(|e| core_error(e, "Failed to apply MCP configuration".to_string()))
    }

    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.check_open()?;
        self.manager
            .shutdown()
            .await
            .context("Failed to shut down MCP servers")
    }

    /// Attach a handler for one of the named lifecycle events
    ///
    /// Accepted names: `serverAdded`, `serverRemoved`, `serverError`,
    /// `reconnection-scheduled`, `reconnection-succeeded`,
    /// `reconnection-failed`, `server-unhealthy`, `token-limit-exceeded`,
    /// `token-warning`.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&McpEvent) + Send + Sync + 'static,
    {
        let kind = EventKind::from_name(event)
            .with_context(|| format!("Unknown MCP event name: {}", event))?;

        let mut handlers = self.handlers.lock();
        let Some(ids) = handlers.as_mut() else {
            bail!("MCP facade disposed");
        };
        let id = self.manager.events().on(kind, handler);
        ids.insert(id);
        Ok(id)
    }

    /// Detach one handler; false if it is unknown or already detached
    pub fn off(&self, id: HandlerId) -> bool {
        let removed = self
            .handlers
            .lock()
            .as_mut()
            .is_some_and(|ids| ids.remove(&id));
        removed && self.manager.events().off(id)
    }

    /// Detach every handler registered here and make the facade unusable
    pub fn dispose(&self) {
        let Some(ids) = self.handlers.lock().take() else {
            return;
        };
        for id in &ids {
            self.manager.events().off(*id);
        }
        debug!(handlers = ids.len(), "MCP facade disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.handlers.lock().is_none()
    }
}

impl Drop for LegacyMcpManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
