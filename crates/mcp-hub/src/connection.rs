//! Per-server connection state

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::ids::ServerName;
use crate::protocol::ServerInfo;
use crate::state::ConnectionState;
use crate::tokens::{BudgetUpdate, TokenBudget, TokenUsage};
use crate::transport::{Transport, TransportType};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot of one connection for status displays
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: ServerName,
    pub state: ConnectionState,
    pub transport: TransportType,
    pub enabled: bool,
    pub tools: usize,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub tokens: TokenUsage,
    pub server_version: Option<String>,
    pub pending_calls: usize,
}

/// One configured MCP server
///
/// State changes go through [`ServerConnection::transition`], which checks the
/// state machine under the connection's own lock. Outbound calls go through
/// [`ServerConnection::exclusive`], which holds a capacity-1 semaphore for the
/// whole send/await window.
pub struct ServerConnection {
    name: ServerName,
    config: ServerConfig,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    last_error: Mutex<Option<String>>,
    server_info: Mutex<Option<ServerInfo>>,
    reconnect_attempts: AtomicU32,
    tokens: Mutex<TokenBudget>,
    request_guard: Semaphore,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerConnection {
    pub fn new(name: ServerName, config: ServerConfig) -> Self {
        let tokens = TokenBudget::new(config.token_limit, config.token_warning_ratio);
        Self {
            name,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            transport: Mutex::new(None),
            last_error: Mutex::new(None),
            server_info: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            tokens: Mutex::new(tokens),
            request_guard: Semaphore::new(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Apply a state change if the state machine allows it
    ///
    /// Returns the previous state.
    pub fn transition(&self, to: ConnectionState) -> McpResult<ConnectionState> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(McpError::InvalidTransition {
                server: self.name.to_string(),
                from,
                to,
            });
        }
        *state = to;
        debug!(server = %self.name, %from, %to, "MCP connection state changed");
        Ok(from)
    }

    /// Move `from -> to` only if the connection is currently in `from`
    pub fn transition_if(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from || !from.can_transition_to(to) {
            return false;
        }
        *state = to;
        debug!(server = %self.name, %from, %to, "MCP connection state changed");
        true
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    /// Install a live transport; returns any instance that was still present
    pub fn install_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.transport.lock().replace(transport)
    }

    pub fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().take()
    }

    /// Whether `transport` is the instance currently installed
    pub fn is_current(&self, transport: &Arc<dyn Transport>) -> bool {
        self.transport
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, transport))
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_error(&self, error: impl ToString) {
        *self.last_error.lock() = Some(error.to_string());
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn set_server_info(&self, info: ServerInfo) {
        *self.server_info.lock() = Some(info);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::SeqCst);
    }

    pub fn record_tokens(&self, tokens: u64) -> (BudgetUpdate, TokenUsage) {
        let mut budget = self.tokens.lock();
        let update = budget.record(tokens);
        (update, budget.usage())
    }

    /// Usage when the hard limit has been crossed
    pub fn exhausted_budget(&self) -> Option<TokenUsage> {
        let budget = self.tokens.lock();
        budget.is_exhausted().then(|| budget.usage())
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.tokens.lock().usage()
    }

    pub fn reset_tokens(&self) {
        self.tokens.lock().reset();
    }

    /// Keep a background task tied to this connection's lifetime
    pub fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Fail queued and future calls immediately
    pub fn close_requests(&self) {
        self.request_guard.close();
    }

    /// Run `f` against the live transport while holding the request guard
    ///
    /// `timeout` covers waiting for the guard as well as the call itself; `f`
    /// receives the time left.
    pub async fn exclusive<T, F, Fut>(&self, method: &str, timeout: Duration, f: F) -> McpResult<T>
    where
        F: FnOnce(Arc<dyn Transport>, Duration) -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        let timed_out = || McpError::CallTimeout {
            method: method.to_string(),
            timeout,
        };
        let deadline = Instant::now() + timeout;

        let _permit = tokio::time::timeout_at(deadline, self.request_guard.acquire())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| McpError::Cancelled(format!("MCP server '{}' was removed", self.name)))?;

        let state = self.state();
        let transport = match (state, self.transport()) {
            (ConnectionState::Connected, Some(transport)) => transport,
            _ => {
                return Err(McpError::ServerNotConnected {
                    server: self.name.to_string(),
                    state,
                })
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout_at(deadline, f(transport, remaining))
            .await
            .map_err(|_| timed_out())?
    }

    pub fn status(&self, tools: usize) -> ServerStatus {
        let transport = self.transport();
        ServerStatus {
            name: self.name.clone(),
            state: self.state(),
            transport: self.config.transport.transport_type(),
            enabled: self.config.enabled,
            tools,
            last_error: self.last_error(),
            reconnect_attempts: self.reconnect_attempts(),
            tokens: self.token_usage(),
            server_version: self
                .server_info
                .lock()
                .as_ref()
                .map(|info| match &info.version {
                    Some(version) => format!("{} {}", info.name, version),
                    None => info.name.clone(),
                }),
            pending_calls: transport.map_or(0, |t| t.pending_count()),
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
