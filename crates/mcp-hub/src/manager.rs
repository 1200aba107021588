//! MCP connection manager
//!
//! Owns every server connection, the merged capability registry, token
//! accounting and reconnection. All fallible operations return [`McpResult`].
//!
//! Lock order is `connections` -> `registry` -> per-connection state. No lock
//! is held across an `.await`.

use crate::client::{Discovery, McpClient};
use crate::config::{McpConfig, ServerConfig};
use crate::connection::{ServerConnection, ServerStatus};
use crate::error::{McpError, McpResult};
use crate::events::{EventBus, McpEvent};
use crate::ids::{ServerName, ToolName};
use crate::protocol::{GetPromptResult, ReadResourceResult, ToolOutput};
use crate::registry::{CapabilityRegistry, PromptRecord, ResourceRecord, ToolRecord};
use crate::state::{ConnectionState, RetryPolicy};
use crate::tokens::{count_tokens, TokenLimitPolicy};
use crate::transport::{DefaultTransportFactory, Transport, TransportFactory};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Manager-wide settings
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub token_limit_policy: TokenLimitPolicy,
    /// Time allowed for a health-check ping
    pub health_check_timeout: Duration,
    /// Time allowed for one transport to shut down
    pub disconnect_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            token_limit_policy: TokenLimitPolicy::default(),
            health_check_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&McpConfig> for ManagerOptions {
    fn from(config: &McpConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            token_limit_policy: config.token_limit_policy,
            ..Self::default()
        }
    }
}

/// Outcome of [`McpManager::ensure_servers_initialized`]
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub connected: Vec<ServerName>,
    pub failed: Vec<(ServerName, McpError)>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`McpManager::shutdown`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub servers: usize,
    pub cancelled_calls: usize,
    pub errors: Vec<(ServerName, String)>,
}

/// Outcome of [`McpManager::reconcile`]
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub added: Vec<ServerName>,
    pub removed: Vec<ServerName>,
    pub restarted: Vec<ServerName>,
    pub failed: Vec<(String, McpError)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.restarted.is_empty()
            && self.failed.is_empty()
    }
}

struct ManagerInner {
    connections: RwLock<BTreeMap<ServerName, Arc<ServerConnection>>>,
    registry: RwLock<CapabilityRegistry>,
    events: EventBus,
    factory: Arc<dyn TransportFactory>,
    options: ManagerOptions,
    shut_down: AtomicBool,
}

/// Handle to the connection manager; clones share state
#[derive(Clone)]
pub struct McpManager {
    inner: Arc<ManagerInner>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl McpManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_factory(options, Arc::new(DefaultTransportFactory))
    }

    /// Manager building transports through `factory`
    pub fn with_factory(options: ManagerOptions, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connections: RwLock::new(BTreeMap::new()),
                registry: RwLock::new(CapabilityRegistry::new()),
                events: EventBus::new(),
                factory,
                options,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Manager with every server of `config` configured but not connected
    pub fn from_config(config: &McpConfig) -> McpResult<Self> {
        let manager = Self::new(ManagerOptions::from(config));
        for server in &config.servers {
            manager.configure_server(server.clone())?;
        }
        Ok(manager)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Receiver for lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.is_shut_down() {
            Err(McpError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: McpEvent) {
        self.inner.events.emit(event);
    }

    fn connection(&self, name: &ServerName) -> Option<Arc<ServerConnection>> {
        self.inner.connections.read().get(name).cloned()
    }

    fn connected_servers(&self) -> HashSet<ServerName> {
        self.inner
            .connections
            .read()
            .values()
            .filter(|conn| conn.state().is_connected())
            .map(|conn| conn.name().clone())
            .collect()
    }

    /// Record a server without connecting it
    pub fn configure_server(&self, config: ServerConfig) -> McpResult<ServerName> {
        self.ensure_open()?;
        let name = config.validate()?;

        let mut connections = self.inner.connections.write();
        if connections.contains_key(&name) {
            return Err(McpError::DuplicateServer(name.to_string()));
        }
        connections.insert(
            name.clone(),
            Arc::new(ServerConnection::new(name.clone(), config)),
        );
        debug!(server = %name, "MCP server configured");
        Ok(name)
    }

    /// Add a server and connect it
    ///
    /// A failed connect leaves the server configured in `Failed` so that
    /// [`McpManager::ensure_servers_initialized`] can retry it.
    pub async fn add_server(&self, config: ServerConfig) -> McpResult<()> {
        let enabled = config.enabled;
        let name = self.configure_server(config)?;

        if !enabled {
            info!(server = %name, "MCP server is disabled; not connecting");
            return Ok(());
        }

        let conn = self
            .connection(&name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        self.connect_and_announce(&conn).await.map(|_| ())
    }

    /// Disconnect and forget a server
    pub async fn remove_server(&self, name: &ServerName) -> McpResult<()> {
        self.ensure_open()?;
        let conn = self
            .inner
            .connections
            .write()
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        if let Err(e) = self.teardown(&conn).await {
            warn!(server = %name, error = %e, "MCP server did not disconnect cleanly");
        }
        info!(server = %name, "MCP server removed");
        self.emit(McpEvent::ServerRemoved {
            server: name.clone(),
        });
        Ok(())
    }

    /// Dispose transport, purge records and mark the connection `Removed`
    ///
    /// Returns the number of calls that were still pending.
    async fn teardown(&self, conn: &Arc<ServerConnection>) -> McpResult<usize> {
        conn.abort_tasks();
        conn.close_requests();

        let transport = {
            let mut registry = self.inner.registry.write();
            registry.purge_server(conn.name());
            if let Err(e) = conn.transition(ConnectionState::Removed) {
                debug!(server = %conn.name(), error = %e, "Connection already removed");
            }
            conn.take_transport()
        };

        let Some(transport) = transport else {
            return Ok(0);
        };
        let pending = transport.pending_count();
        tokio::time::timeout(self.inner.options.disconnect_timeout, transport.disconnect())
            .await
            .map_err(|_| {
                McpError::Unreachable(format!(
                    "MCP server '{}' did not disconnect in time",
                    conn.name()
                ))
            })?;
        Ok(pending)
    }

    /// Drive `Disconnected|Failed -> Connecting -> Connected` and emit the outcome
    async fn connect_and_announce(&self, conn: &Arc<ServerConnection>) -> McpResult<Vec<ToolName>> {
        match self.connect(conn).await {
            Ok(tools) => {
                info!(server = %conn.name(), tools = tools.len(), "MCP server connected");
                self.emit(McpEvent::ServerAdded {
                    server: conn.name().clone(),
                    tools: tools.clone(),
                });
                Ok(tools)
            }
            Err(e) => {
                warn!(server = %conn.name(), error = %e, "Failed to connect MCP server");
                self.emit(McpEvent::ServerError {
                    server: conn.name().clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn connect(&self, conn: &Arc<ServerConnection>) -> McpResult<Vec<ToolName>> {
        conn.transition(ConnectionState::Connecting)?;

        let established = self.establish(conn).await;
        let result = match established {
            Ok((transport, discovery)) => self.install(conn, transport, discovery).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            conn.set_error(e);
            self.fail(conn);
        }
        result
    }

    /// Create, connect and handshake a fresh transport within the init timeout
    async fn establish(
        &self,
        conn: &ServerConnection,
    ) -> McpResult<(Arc<dyn Transport>, Discovery)> {
        let config = conn.config();
        let timeout = config.init_timeout();
        let transport = self.inner.factory.create(conn.name(), config)?;

        let handshake = async {
            transport.connect().await?;
            McpClient::new(transport.as_ref(), timeout).discover().await
        };

        let handshake_timeout = || McpError::HandshakeTimeout {
            server: conn.name().to_string(),
            timeout,
        };

        let handshake = tokio::time::timeout(timeout, handshake).await;
        let outcome = match handshake {
            Ok(Ok(discovery)) => return Ok((transport, discovery)),
            Ok(Err(McpError::CallTimeout { .. })) | Err(_) => handshake_timeout(),
            Ok(Err(e)) => e,
        };

        transport.disconnect().await;
        Err(outcome)
    }

    /// Register discovered capabilities and mark the connection `Connected`
    ///
    /// The registry write, the state change and the transport install happen
    /// under the registry lock, so a concurrent removal either sees nothing
    /// or sees the finished install.
    async fn install(
        &self,
        conn: &Arc<ServerConnection>,
        transport: Arc<dyn Transport>,
        discovery: Discovery,
    ) -> McpResult<Vec<ToolName>> {
        let name = conn.name();
        let config = conn.config();

        let tools: Vec<ToolRecord> = discovery
            .tools
            .into_iter()
            .filter(|tool| config.allows_tool(&tool.name))
            .filter_map(|tool| match ToolRecord::from_info(name, tool) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(server = %name, error = %e, "Skipping MCP tool with invalid name");
                    None
                }
            })
            .collect();
        let prompts = discovery
            .prompts
            .into_iter()
            .map(|p| PromptRecord::from_info(name, p))
            .collect();
        let resources = discovery
            .resources
            .into_iter()
            .map(|r| ResourceRecord::from_info(name, r))
            .collect();

        let installed = {
            let mut registry = self.inner.registry.write();
            match conn.transition(ConnectionState::Connected) {
                Ok(_) => {
                    let names = registry.register_server(name, tools, prompts, resources);
                    let stale = conn.install_transport(transport.clone());
                    Ok((names, stale))
                }
                Err(e) => Err(e),
            }
        };

        let (names, stale) = match installed {
            Ok(installed) => installed,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };
        if let Some(stale) = stale {
            stale.disconnect().await;
        }

        conn.clear_error();
        conn.set_reconnect_attempts(0);
        conn.set_server_info(discovery.init.server_info);
        self.watch_transport(conn, transport);
        Ok(names)
    }

    /// `-> Failed`, purging the server's records
    fn fail(&self, conn: &ServerConnection) {
        let mut registry = self.inner.registry.write();
        if conn.transition(ConnectionState::Failed).is_ok() {
            registry.purge_server(conn.name());
        }
    }

    /// Degrade the connection when its transport closes on its own
    fn watch_transport(&self, conn: &Arc<ServerConnection>, transport: Arc<dyn Transport>) {
        let weak = Arc::downgrade(&self.inner);
        let watched = conn.clone();
        let mut closed = transport.closed();

        let handle = tokio::spawn(async move {
            // Err means the transport was dropped, which also ends the channel
            let _ = closed.wait_for(|closed| *closed).await;
            let Some(manager) = McpManager::upgrade(&weak) else {
                return;
            };
            if watched.is_current(&transport) {
                manager.degrade(
                    &watched,
                    McpError::ConnectionClosed("transport closed unexpectedly".to_string()),
                );
            }
        });
        conn.track_task(handle);
    }

    fn upgrade(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// `Connected -> Degraded` and schedule reconnection; no-op if already left
    fn degrade(&self, conn: &Arc<ServerConnection>, error: McpError) {
        if self.is_shut_down()
            || !conn.transition_if(ConnectionState::Connected, ConnectionState::Degraded)
        {
            return;
        }

        warn!(server = %conn.name(), error = %error, "MCP server degraded");
        conn.set_error(&error);
        self.emit(McpEvent::ServerError {
            server: conn.name().clone(),
            error: error.to_string(),
        });

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(reconnect_loop(weak, conn.clone()));
        conn.track_task(handle);
    }

    /// Call a tool by bare or qualified name
    pub async fn call_tool(&self, tool: &ToolName, arguments: Value) -> McpResult<ToolOutput> {
        self.ensure_open()?;

        let record = self
            .inner
            .registry
            .read()
            .resolve_tool(tool)
            .cloned()
            .ok_or_else(|| McpError::UnknownTool(tool.to_string()))?;
        let conn = self
            .connection(&record.server)
            .ok_or_else(|| McpError::UnknownTool(tool.to_string()))?;

        let state = conn.state();
        if !state.is_connected() {
            return Err(McpError::ServerNotConnected {
                server: record.server.to_string(),
                state,
            });
        }

        if self.inner.options.token_limit_policy == TokenLimitPolicy::Reject {
            if let Some(usage) = conn.exhausted_budget() {
                return Err(McpError::TokenLimitExceeded {
                    server: record.server.to_string(),
                    used: usage.used,
                    limit: usage.limit.unwrap_or_default(),
                });
            }
        }

        let arguments_text = arguments.to_string();
        let tool_name = record.name.to_string();
        let timeout = conn.config().call_timeout();

        debug!(server = %record.server, tool = %tool_name, "Calling MCP tool");
        let result = conn
            .exclusive("tools/call", timeout, |transport, remaining| async move {
                McpClient::new(transport.as_ref(), remaining)
                    .call_tool(&tool_name, arguments)
                    .await
            })
            .await;

        match result {
            Ok(result) => {
                let output = ToolOutput::from(result);
                let tokens = count_tokens(&arguments_text) + count_tokens(&output.output);
                self.record_tokens(&conn, tokens);
                Ok(output)
            }
            Err(e) => {
                if e.is_connection_loss() {
                    self.degrade(&conn, e.clone());
                }
                Err(e)
            }
        }
    }

    fn record_tokens(&self, conn: &ServerConnection, tokens: u64) {
        let (update, usage) = conn.record_tokens(tokens);
        let limit = usage.limit.unwrap_or_default();

        if update.warning_crossed {
            info!(server = %conn.name(), used = usage.used, limit, "MCP server nearing token limit");
            self.emit(McpEvent::TokenWarning {
                server: conn.name().clone(),
                used: usage.used,
                limit,
            });
        }
        if update.limit_crossed {
            warn!(server = %conn.name(), used = usage.used, limit, "MCP server exceeded token limit");
            self.emit(McpEvent::TokenLimitExceeded {
                server: conn.name().clone(),
                used: usage.used,
                limit,
            });
        }
    }

    /// Clear a server's token counters
    pub fn reset_token_usage(&self, name: &ServerName) -> McpResult<()> {
        let conn = self
            .connection(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        conn.reset_tokens();
        debug!(server = %name, "MCP token usage reset");
        Ok(())
    }

    /// Tools of connected servers, in registration order
    pub fn get_tools(&self) -> Vec<ToolRecord> {
        let connected = self.connected_servers();
        self.inner
            .registry
            .read()
            .tools()
            .filter(|tool| connected.contains(&tool.server))
            .cloned()
            .collect()
    }

    pub fn get_prompts(&self) -> Vec<PromptRecord> {
        let connected = self.connected_servers();
        self.inner
            .registry
            .read()
            .prompts()
            .iter()
            .filter(|prompt| connected.contains(&prompt.server))
            .cloned()
            .collect()
    }

    pub fn get_resources(&self) -> Vec<ResourceRecord> {
        let connected = self.connected_servers();
        self.inner
            .registry
            .read()
            .resources()
            .iter()
            .filter(|resource| connected.contains(&resource.server))
            .cloned()
            .collect()
    }

    /// Names of every configured server
    pub fn get_servers(&self) -> Vec<ServerName> {
        self.inner.connections.read().keys().cloned().collect()
    }

    pub fn get_connection_status(&self) -> Vec<ServerStatus> {
        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        let registry = self.inner.registry.read();
        connections
            .iter()
            .map(|conn| conn.status(registry.tools_for(conn.name()).count()))
            .collect()
    }

    pub fn server_status(&self, name: &ServerName) -> McpResult<ServerStatus> {
        let conn = self
            .connection(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        let tools = self.inner.registry.read().tools_for(name).count();
        Ok(conn.status(tools))
    }

    /// Connect every enabled server that is not connected yet
    ///
    /// Servers are brought up concurrently. Individual failures are reported
    /// through events and the returned report, never as an error.
    pub async fn ensure_servers_initialized(&self) -> McpResult<InitReport> {
        self.ensure_open()?;

        let targets: Vec<Arc<ServerConnection>> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|conn| {
                conn.config().enabled
                    && matches!(
                        conn.state(),
                        ConnectionState::Disconnected | ConnectionState::Failed
                    )
            })
            .cloned()
            .collect();

        let outcomes = join_all(targets.iter().map(|conn| async move {
            (conn.name().clone(), self.connect_and_announce(conn).await)
        }))
        .await;

        let mut report = InitReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => report.connected.push(name),
                // Lost a race with another initializer or a removal
                Err(McpError::InvalidTransition { .. }) => {}
                Err(e) => report.failed.push((name, e)),
            }
        }
        Ok(report)
    }

    /// Disconnect everything and cancel pending calls
    ///
    /// Idempotent; connections stay listed in `Removed` state.
    pub async fn shutdown(&self) -> McpResult<ShutdownReport> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(ShutdownReport::default());
        }

        let connections: Vec<_> = self.inner.connections.read().values().cloned().collect();
        info!(servers = connections.len(), "Shutting down MCP servers");

        let outcomes = join_all(connections.iter().map(|conn| async move {
            (conn.name().clone(), self.teardown(conn).await)
        }))
        .await;

        let mut report = ShutdownReport {
            servers: connections.len(),
            ..Default::default()
        };
        for (name, outcome) in outcomes {
            match outcome {
                Ok(cancelled) => report.cancelled_calls += cancelled,
                Err(e) => {
                    warn!(server = %name, error = %e, "Error shutting down MCP server");
                    report.errors.push((name.clone(), e.to_string()));
                }
            }
            self.emit(McpEvent::ServerRemoved { server: name });
        }
        Ok(report)
    }

    /// Render a prompt by bare or `server/prompt` name
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> McpResult<GetPromptResult> {
        self.ensure_open()?;
        let record = self
            .inner
            .registry
            .read()
            .find_prompt(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownPrompt(name.to_string()))?;
        let conn = self
            .connection(&record.server)
            .ok_or_else(|| McpError::UnknownPrompt(name.to_string()))?;

        let prompt = record.name.clone();
        let result = conn
            .exclusive("prompts/get", conn.config().call_timeout(), |transport, remaining| async move {
                McpClient::new(transport.as_ref(), remaining)
                    .get_prompt(&prompt, arguments)
                    .await
            })
            .await;
        self.observe(&conn, result)
    }

    /// Read a resource from a specific server
    pub async fn read_resource(&self, server: &ServerName, uri: &str) -> McpResult<ReadResourceResult> {
        self.ensure_open()?;
        let conn = self
            .connection(server)
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))?;

        let result = conn
            .exclusive("resources/read", conn.config().call_timeout(), |transport, remaining| async move {
                McpClient::new(transport.as_ref(), remaining)
                    .read_resource(uri)
                    .await
            })
            .await;
        self.observe(&conn, result)
    }

    fn observe<T>(&self, conn: &Arc<ServerConnection>, result: McpResult<T>) -> McpResult<T> {
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.degrade(conn, e.clone());
            }
        }
        result
    }

    /// Ping every connected server; unresponsive ones are degraded
    pub async fn health_check(&self) -> Vec<(ServerName, McpResult<()>)> {
        let connections: Vec<_> = self
            .inner
            .connections
            .read()
            .values()
            .filter(|conn| conn.state().is_connected())
            .cloned()
            .collect();
        let timeout = self.inner.options.health_check_timeout;

        join_all(connections.iter().map(|conn| async move {
            let result = conn
                .exclusive("ping", timeout, |transport, remaining| async move {
                    McpClient::new(transport.as_ref(), remaining).ping().await
                })
                .await;
            if let Err(e) = &result {
                if e.is_connection_loss() || matches!(e, McpError::CallTimeout { .. }) {
                    self.degrade(conn, e.clone());
                }
            }
            (conn.name().clone(), result)
        }))
        .await
    }

    /// Bring the configured set in line with `configs`
    ///
    /// Missing servers are removed, new ones added and changed ones restarted.
    /// Per-server failures are collected in the report.
    pub async fn reconcile(&self, configs: Vec<ServerConfig>) -> McpResult<ReconcileReport> {
        self.ensure_open()?;
        let mut report = ReconcileReport::default();

        let mut desired: BTreeMap<ServerName, ServerConfig> = BTreeMap::new();
        for config in configs {
            match config.validate() {
                Ok(name) => {
                    desired.insert(name, config);
                }
                Err(e) => report.failed.push((config.name.clone(), e)),
            }
        }

        let current: Vec<(ServerName, ServerConfig)> = self
            .inner
            .connections
            .read()
            .iter()
            .map(|(name, conn)| (name.clone(), conn.config().clone()))
            .collect();

        for (name, config) in &current {
            match desired.get(name) {
                None => match self.remove_server(name).await {
                    Ok(()) => report.removed.push(name.clone()),
                    Err(e) => report.failed.push((name.to_string(), e)),
                },
                Some(wanted) if wanted != config => {
                    if let Err(e) = self.remove_server(name).await {
                        report.failed.push((name.to_string(), e));
                        continue;
                    }
                    match self.add_server(wanted.clone()).await {
                        Ok(()) => report.restarted.push(name.clone()),
                        Err(e) => report.failed.push((name.to_string(), e)),
                    }
                }
                Some(_) => {}
            }
        }

        let known: HashSet<_> = current.into_iter().map(|(name, _)| name).collect();
        for (name, config) in desired {
            if known.contains(&name) {
                continue;
            }
            match self.add_server(config).await {
                Ok(()) => report.added.push(name),
                Err(e) => report.failed.push((name.to_string(), e)),
            }
        }

        Ok(report)
    }
}

/// Retry a degraded connection with backoff until it recovers or the policy
/// gives up
async fn reconnect_loop(weak: Weak<ManagerInner>, conn: Arc<ServerConnection>) {
    let Some(policy) = weak.upgrade().map(|inner| inner.options.retry.clone()) else {
        return;
    };
    if !policy.allows(1) {
        if let Some(manager) = McpManager::upgrade(&weak) {
            manager.fail(&conn);
            warn!(server = %conn.name(), "MCP server marked unhealthy, reconnection disabled");
            manager.emit(McpEvent::ServerUnhealthy {
                server: conn.name().clone(),
                attempts: 0,
                error: conn
                    .last_error()
                    .unwrap_or_else(|| "connection lost".to_string()),
            });
        }
        return;
    }
    let mut attempt = 0;

    loop {
        attempt += 1;
        let delay = policy.delay(attempt);

        match McpManager::upgrade(&weak) {
            Some(manager) => manager.emit(McpEvent::ReconnectionScheduled {
                server: conn.name().clone(),
                attempt,
                delay,
            }),
            None => return,
        }
        debug!(server = %conn.name(), attempt, delay_ms = delay.as_millis() as u64, "Reconnecting MCP server");
        tokio::time::sleep(delay).await;

        let Some(manager) = McpManager::upgrade(&weak) else {
            return;
        };
        if manager.is_shut_down() || conn.transition(ConnectionState::Reconnecting).is_err() {
            return;
        }
        conn.set_reconnect_attempts(attempt);

        // The old instance must be gone before a new one is created
        let stale = {
            let mut registry = manager.inner.registry.write();
            registry.purge_server(conn.name());
            conn.take_transport()
        };
        if let Some(stale) = stale {
            stale.disconnect().await;
        }

        let outcome = match manager.establish(&conn).await {
            Ok((transport, discovery)) => manager.install(&conn, transport, discovery).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(tools) => {
                info!(server = %conn.name(), attempt, tools = tools.len(), "MCP server reconnected");
                manager.emit(McpEvent::ReconnectionSucceeded {
                    server: conn.name().clone(),
                    attempt,
                });
                return;
            }
            // Removed while reconnecting
            Err(McpError::InvalidTransition { .. }) => return,
            Err(e) => {
                warn!(server = %conn.name(), attempt, error = %e, "MCP reconnection failed");
                conn.set_error(&e);
                manager.emit(McpEvent::ReconnectionFailed {
                    server: conn.name().clone(),
                    attempt,
                    error: e.to_string(),
                });

                if policy.allows(attempt + 1) {
                    if conn.transition(ConnectionState::Degraded).is_err() {
                        return;
                    }
                    continue;
                }

                manager.fail(&conn);
                warn!(server = %conn.name(), attempts = attempt, "MCP server marked unhealthy");
                manager.emit(McpEvent::ServerUnhealthy {
                    server: conn.name().clone(),
                    attempts: attempt,
                    error: e.to_string(),
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::mock::MockFactory;
    use serde_json::json;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn fast_options() -> ManagerOptions {
        ManagerOptions {
            retry: RetryPolicy::fixed(Duration::from_millis(10), 3),
            ..Default::default()
        }
    }

    fn manager(factory: &Arc<MockFactory>) -> McpManager {
        McpManager::with_factory(fast_options(), factory.clone())
    }

    fn tool(name: &str) -> ToolName {
        ToolName::new(name).unwrap()
    }

    fn server(name: &str) -> ServerName {
        ServerName::new(name).unwrap()
    }

    fn config(name: &str) -> ServerConfig {
        ServerConfig::stdio(name, "mock").with_init_timeout(Duration::from_millis(500))
    }

    async fn next_event(rx: &mut broadcast::Receiver<McpEvent>, kind: EventKind) -> McpEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} event", kind))
    }

    #[tokio::test]
    async fn test_add_server_registers_tools() {
        let factory = MockFactory::new();
        factory.server("fs", &["read", "write"]);
        let manager = manager(&factory);
        let mut rx = manager.subscribe();

        manager.add_server(config("fs")).await.unwrap();

        assert_eq!(manager.get_servers(), vec![server("fs")]);
        let tools: Vec<_> = manager.get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec![tool("read"), tool("write")]);
        assert_eq!(manager.get_prompts().len(), 1);
        assert_eq!(manager.get_resources().len(), 1);

        match next_event(&mut rx, EventKind::ServerAdded).await {
            McpEvent::ServerAdded { server: name, tools } => {
                assert_eq!(name, server("fs"));
                assert_eq!(tools.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_leaves_first_intact() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = manager(&factory);

        manager.add_server(config("fs")).await.unwrap();
        let err = manager.add_server(config("fs")).await.unwrap_err();
        assert_eq!(err, McpError::DuplicateServer("fs".into()));

        assert_eq!(manager.get_servers().len(), 1);
        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 1);
        let output = manager
            .call_tool(&tool("echo"), json!({"text": "still here"}))
            .await
            .unwrap();
        assert_eq!(output.output, "still here");
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let manager = manager(&MockFactory::new());
        let err = manager.add_server(config("bad name")).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidServerName { .. }));
        assert!(manager.get_servers().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_marks_failed() {
        let factory = MockFactory::new();
        let state = factory.server("slow", &["echo"]);
        state.hang_initialize.store(true, AtomicOrdering::SeqCst);
        let manager = manager(&factory);
        let mut rx = manager.subscribe();

        let err = manager
            .add_server(config("slow").with_init_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::HandshakeTimeout { .. }));

        let status = manager.server_status(&server("slow")).unwrap();
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(status.last_error.is_some());
        assert!(manager.get_tools().is_empty());
        next_event(&mut rx, EventKind::ServerError).await;

        // A later initialization retries it
        state.hang_initialize.store(false, AtomicOrdering::SeqCst);
        let report = manager.ensure_servers_initialized().await.unwrap();
        assert_eq!(report.connected, vec![server("slow")]);
        assert_eq!(
            manager.server_status(&server("slow")).unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_call_tool_routes_and_counts() {
        let factory = MockFactory::new();
        factory.server("a", &["echo"]);
        factory.server("b", &["fail"]);
        let manager = manager(&factory);
        manager.add_server(config("a")).await.unwrap();
        manager.add_server(config("b")).await.unwrap();

        let output = manager
            .call_tool(&tool("echo"), json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.output, "hi");

        let failed = manager.call_tool(&tool("b/fail"), json!({})).await.unwrap();
        assert!(!failed.success);

        let err = manager.call_tool(&tool("missing"), json!({})).await.unwrap_err();
        assert_eq!(err, McpError::UnknownTool("missing".into()));

        let status = manager.server_status(&server("a")).unwrap();
        assert!(status.tokens.used > 0);
    }

    #[tokio::test]
    async fn test_same_server_serialized_different_servers_parallel() {
        let factory = MockFactory::new();
        let a = factory.server("a", &["slow"]);
        let b = factory.server("b", &["slow"]);
        let manager = manager(&factory);
        manager.add_server(config("a")).await.unwrap();
        manager.add_server(config("b")).await.unwrap();

        let a_slow = tool("a/slow");
        let b_slow = tool("b/slow");
        let args = json!({"ms": 100, "text": "x"});
        let started = tokio::time::Instant::now();
        let (r1, r2, r3) = tokio::join!(
            manager.call_tool(&a_slow, args.clone()),
            manager.call_tool(&a_slow, args.clone()),
            manager.call_tool(&b_slow, args.clone()),
        );
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());

        assert_eq!(a.max_in_flight(), 1);
        assert_eq!(b.max_in_flight(), 1);
        // Two serialized calls on `a`, with `b` overlapping them
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300 + 250));
    }

    #[tokio::test]
    async fn test_call_timeout_does_not_degrade() {
        let factory = MockFactory::new();
        factory.server("a", &["hang", "echo"]);
        let manager = manager(&factory);
        manager
            .add_server(config("a").with_call_timeout(Duration::from_millis(50)))
            .await
            .unwrap();

        let err = manager.call_tool(&tool("hang"), json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::CallTimeout { .. }));
        assert_eq!(
            manager.server_status(&server("a")).unwrap().state,
            ConnectionState::Connected
        );
        assert!(manager
            .call_tool(&tool("echo"), json!({"text": "ok"}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_remove_then_call_is_unknown_tool() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = manager(&factory);
        let mut rx = manager.subscribe();
        manager.add_server(config("fs")).await.unwrap();

        manager.remove_server(&server("fs")).await.unwrap();
        next_event(&mut rx, EventKind::ServerRemoved).await;

        let err = manager.call_tool(&tool("echo"), json!({})).await.unwrap_err();
        assert_eq!(err, McpError::UnknownTool("echo".into()));
        assert!(manager.get_servers().is_empty());
        assert_eq!(state.disconnects.load(AtomicOrdering::SeqCst), 1);

        let err = manager.remove_server(&server("fs")).await.unwrap_err();
        assert_eq!(err, McpError::ServerNotFound("fs".into()));
    }

    #[tokio::test]
    async fn test_kill_degrades_and_reconnects() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = McpManager::with_factory(
            ManagerOptions {
                retry: RetryPolicy::fixed(Duration::from_millis(200), 3),
                ..Default::default()
            },
            factory.clone(),
        );
        let mut rx = manager.subscribe();
        manager.add_server(config("fs")).await.unwrap();

        state.kill();

        next_event(&mut rx, EventKind::ServerError).await;
        let err = manager
            .call_tool(&tool("echo"), json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Connection);

        match next_event(&mut rx, EventKind::ReconnectionScheduled).await {
            McpEvent::ReconnectionScheduled { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("unexpected event {:?}", other),
        }
        next_event(&mut rx, EventKind::ReconnectionSucceeded).await;

        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 2);
        let output = manager
            .call_tool(&tool("echo"), json!({"text": "back"}))
            .await
            .unwrap();
        assert_eq!(output.output, "back");
        assert_eq!(manager.server_status(&server("fs")).unwrap().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_marks_unhealthy() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = manager(&factory);
        let mut rx = manager.subscribe();
        manager.add_server(config("fs")).await.unwrap();

        state.fail_connects.store(10, AtomicOrdering::SeqCst);
        state.kill();

        match next_event(&mut rx, EventKind::ServerUnhealthy).await {
            McpEvent::ServerUnhealthy { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected event {:?}", other),
        }
        let status = manager.server_status(&server("fs")).unwrap();
        assert_eq!(status.state, ConnectionState::Failed);
        assert_eq!(status.tools, 0);
        assert!(manager.get_tools().is_empty());
    }

    #[tokio::test]
    async fn test_no_reconnect_when_attempts_disabled() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = McpManager::with_factory(
            ManagerOptions {
                retry: RetryPolicy::fixed(Duration::from_millis(10), 0),
                ..Default::default()
            },
            factory.clone(),
        );
        let mut rx = manager.subscribe();
        manager.add_server(config("fs")).await.unwrap();
        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 1);

        state.kill();

        match next_event(&mut rx, EventKind::ServerUnhealthy).await {
            McpEvent::ServerUnhealthy { attempts, .. } => assert_eq!(attempts, 0),
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 1);
        let status = manager.server_status(&server("fs")).unwrap();
        assert_eq!(status.state, ConnectionState::Failed);
        assert!(manager.get_tools().is_empty());
    }

    #[tokio::test]
    async fn test_remove_server_survives_hung_disconnect() {
        let factory = MockFactory::new();
        let state = factory.server("fs", &["echo"]);
        let manager = McpManager::with_factory(
            ManagerOptions {
                disconnect_timeout: Duration::from_millis(50),
                ..fast_options()
            },
            factory.clone(),
        );
        let mut rx = manager.subscribe();
        manager.add_server(config("fs")).await.unwrap();
        state.hang_disconnect.store(true, AtomicOrdering::SeqCst);

        let started = std::time::Instant::now();
        manager.remove_server(&server("fs")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        next_event(&mut rx, EventKind::ServerRemoved).await;
        assert!(manager.server_status(&server("fs")).is_err());
        assert!(manager.get_tools().is_empty());
    }

    #[tokio::test]
    async fn test_token_limit_exceeded_once_then_rejected() {
        let factory = MockFactory::new();
        factory.server("fs", &["big", "echo"]);
        let manager = manager(&factory);
        let exceeded = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = exceeded.clone();
        manager.events().on(EventKind::TokenLimitExceeded, move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });
        manager
            .add_server(config("fs").with_token_limit(100))
            .await
            .unwrap();

        manager.call_tool(&tool("big"), json!({})).await.unwrap();
        assert_eq!(exceeded.load(AtomicOrdering::SeqCst), 1);

        for _ in 0..3 {
            let err = manager
                .call_tool(&tool("echo"), json!({"text": "x"}))
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::TokenLimitExceeded { limit: 100, .. }));
        }
        assert_eq!(exceeded.load(AtomicOrdering::SeqCst), 1);

        manager.reset_token_usage(&server("fs")).unwrap();
        assert!(manager
            .call_tool(&tool("echo"), json!({"text": "x"}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_warn_only_policy_keeps_serving() {
        let factory = MockFactory::new();
        factory.server("fs", &["big"]);
        let manager = McpManager::with_factory(
            ManagerOptions {
                token_limit_policy: TokenLimitPolicy::WarnOnly,
                ..fast_options()
            },
            factory.clone(),
        );
        let mut rx = manager.subscribe();
        manager
            .add_server(config("fs").with_token_limit(10))
            .await
            .unwrap();

        manager.call_tool(&tool("big"), json!({})).await.unwrap();
        next_event(&mut rx, EventKind::TokenWarning).await;
        next_event(&mut rx, EventKind::TokenLimitExceeded).await;
        assert!(manager.call_tool(&tool("big"), json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_calls() {
        let factory = MockFactory::new();
        factory.server("a", &["hang"]);
        factory.server("b", &["echo"]);
        let manager = manager(&factory);
        manager.add_server(config("a")).await.unwrap();
        manager.add_server(config("b")).await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.call_tool(&tool("hang"), json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = manager.shutdown().await.unwrap();
        assert_eq!(report.servers, 2);
        assert_eq!(report.cancelled_calls, 1);

        let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(McpError::Cancelled(_))));

        for status in manager.get_connection_status() {
            assert_eq!(status.state, ConnectionState::Removed);
        }
        assert!(manager.get_tools().is_empty());
        assert_eq!(
            manager.call_tool(&tool("echo"), json!({})).await.unwrap_err(),
            McpError::ShutDown
        );
        assert!(manager.shutdown().await.unwrap().errors.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_servers_initialized_isolates_failures() {
        let factory = MockFactory::new();
        factory.server("good", &["echo"]);
        factory.server("bad", &["echo"]).fail_connects.store(1, AtomicOrdering::SeqCst);
        let manager = manager(&factory);
        manager.configure_server(config("good")).unwrap();
        manager.configure_server(config("bad")).unwrap();
        manager
            .configure_server(config("off").enabled(false))
            .unwrap();

        let report = manager.ensure_servers_initialized().await.unwrap();
        assert_eq!(report.connected, vec![server("good")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, server("bad"));

        // Second call retries only the failed one
        let report = manager.ensure_servers_initialized().await.unwrap();
        assert_eq!(report.connected, vec![server("bad")]);
        assert_eq!(
            manager.server_status(&server("off")).unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_allow_list_filters_tools() {
        let factory = MockFactory::new();
        factory.server("fs", &["read", "write"]);
        let manager = manager(&factory);
        manager
            .add_server(config("fs").with_allowed_tools(["read"]))
            .await
            .unwrap();

        let tools: Vec<_> = manager.get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(tools, vec![tool("read")]);
        assert!(matches!(
            manager.call_tool(&tool("write"), json!({})).await,
            Err(McpError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_and_resource() {
        let factory = MockFactory::new();
        factory.server("docs", &["echo"]);
        let manager = manager(&factory);
        manager.add_server(config("docs")).await.unwrap();

        let mut args = Map::new();
        args.insert("who".into(), json!("Grace"));
        let prompt = manager.get_prompt("greet", args).await.unwrap();
        assert_eq!(prompt.messages[0].content["text"], "Hello, Grace!");
        assert!(matches!(
            manager.get_prompt("nope", Map::new()).await,
            Err(McpError::UnknownPrompt(_))
        ));

        let resource = manager
            .read_resource(&server("docs"), "mock://readme")
            .await
            .unwrap();
        assert_eq!(resource.contents[0].text.as_deref(), Some("mock readme"));
    }

    #[tokio::test]
    async fn test_health_check_pings_connected_servers() {
        let factory = MockFactory::new();
        factory.server("a", &["echo"]);
        let manager = manager(&factory);
        manager.add_server(config("a")).await.unwrap();

        manager.configure_server(config("idle")).unwrap();

        let results = manager.health_check().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, server("a"));
        assert!(results[0].1.is_ok());
    }

    #[tokio::test]
    async fn test_reconcile() {
        let factory = MockFactory::new();
        factory.server("keep", &["echo"]);
        factory.server("drop", &["echo"]);
        factory.server("change", &["echo"]);
        factory.server("new", &["echo"]);
        let manager = manager(&factory);
        for name in ["keep", "drop", "change"] {
            manager.add_server(config(name)).await.unwrap();
        }

        let report = manager
            .reconcile(vec![
                config("keep"),
                config("change").with_call_timeout(Duration::from_secs(5)),
                config("new"),
            ])
            .await
            .unwrap();

        assert_eq!(report.removed, vec![server("drop")]);
        assert_eq!(report.restarted, vec![server("change")]);
        assert_eq!(report.added, vec![server("new")]);
        assert!(report.failed.is_empty());
        assert_eq!(
            manager.get_servers(),
            vec![server("change"), server("keep"), server("new")]
        );

        let again = manager
            .reconcile(vec![
                config("keep"),
                config("change").with_call_timeout(Duration::from_secs(5)),
                config("new"),
            ])
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
