//! In-process MCP server used by unit tests

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult, METHOD_NOT_FOUND};
use crate::ids::ServerName;
use crate::protocol::MCP_PROTOCOL_VERSION;
use crate::transport::{Transport, TransportFactory, TransportType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Behaviour and counters shared by every transport built for one server
#[derive(Default)]
pub struct MockState {
    pub tools: Mutex<Vec<&'static str>>,
    pub tools_page_size: Mutex<Option<usize>>,
    pub connects: AtomicU32,
    pub fail_connects: AtomicU32,
    pub hang_initialize: AtomicBool,
    pub hang_disconnect: AtomicBool,
    pub no_prompts: AtomicBool,
    pub calls: AtomicU32,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub disconnects: AtomicU32,
    current: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

impl MockState {
    pub fn new(tools: &[&'static str]) -> Arc<Self> {
        let state = Self::default();
        *state.tools.lock() = tools.to_vec();
        Arc::new(state)
    }

    /// Simulate the server process dying
    pub fn kill(&self) {
        if let Some(tx) = self.current.lock().as_ref() {
            tx.send_replace(true);
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements `in_flight` even when the request future is dropped
struct InFlightGuard<'a>(&'a MockState);

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
    connected: AtomicBool,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl MockTransport {
    pub fn new(state: Arc<MockState>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            state,
            connected: AtomicBool::new(false),
            closed_tx: Arc::new(closed_tx),
        }
    }

    fn alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !*self.closed_tx.borrow()
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let params = params.unwrap_or(Value::Null);
        match method {
            "initialize" => {
                if self.state.hang_initialize.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                let mut capabilities = json!({ "tools": {}, "resources": {} });
                if !self.state.no_prompts.load(Ordering::SeqCst) {
                    capabilities["prompts"] = json!({});
                }
                Ok(json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": { "name": "mock", "version": "1.0" }
                }))
            }
            "tools/list" => {
                let tools = self.state.tools.lock().clone();
                let page_size = self.state.tools_page_size.lock().unwrap_or(tools.len().max(1));
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let end = (start + page_size).min(tools.len());
                let page: Vec<Value> = tools[start..end]
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("{} tool", name),
                            "inputSchema": { "type": "object" }
                        })
                    })
                    .collect();
                let mut result = json!({ "tools": page });
                if end < tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                Ok(result)
            }
            "prompts/list" => {
                if self.state.no_prompts.load(Ordering::SeqCst) {
                    return Err(McpError::Rpc {
                        code: METHOD_NOT_FOUND,
                        message: "Method not found".into(),
                    });
                }
                Ok(json!({ "prompts": [{
                    "name": "greet",
                    "description": "Say hello",
                    "arguments": [{ "name": "who", "required": true }]
                }]}))
            }
            "prompts/get" => {
                let who = params["arguments"]["who"].as_str().unwrap_or("nobody");
                Ok(json!({ "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": format!("Hello, {}!", who) }
                }]}))
            }
            "resources/list" => Ok(json!({ "resources": [{
                "uri": "mock://readme",
                "name": "readme",
                "mimeType": "text/plain"
            }]})),
            "resources/read" => Ok(json!({ "contents": [{
                "uri": params["uri"],
                "text": "mock readme"
            }]})),
            "ping" => Ok(json!({})),
            "tools/call" => self.call_tool(&params).await,
            other => Err(McpError::Rpc {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", other),
            }),
        }
    }

    async fn call_tool(&self, params: &Value) -> McpResult<Value> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        let text = args["text"].as_str().unwrap_or_default().to_string();

        match name {
            "echo" => Ok(json!({ "content": [{ "type": "text", "text": text }] })),
            "slow" => {
                let ms = args["ms"].as_u64().unwrap_or(50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "content": [{ "type": "text", "text": text }] }))
            }
            "hang" => std::future::pending().await,
            "fail" => Ok(json!({
                "content": [{ "type": "text", "text": "tool failed" }],
                "isError": true
            })),
            "big" => Ok(json!({ "content": [{ "type": "text", "text": "word ".repeat(200) }] })),
            _ => Err(McpError::Rpc {
                code: -32602,
                message: format!("Unknown tool: {}", name),
            }),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(McpError::TransportSetup {
                transport: "stdio",
                reason: "mock refused connection".into(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        *self.state.current.lock() = Some(self.closed_tx.clone());
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        self.closed_tx.send_replace(true);
        if self.state.hang_disconnect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        if !self.alive() {
            return Err(McpError::ConnectionClosed("mock server is gone".into()));
        }
        let _guard = InFlightGuard::enter(&self.state);
        let mut closed = self.closed_tx.subscribe();

        tokio::select! {
            outcome = tokio::time::timeout(timeout, self.handle(method, params)) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::CallTimeout { method: method.to_string(), timeout }),
            },
            _ = closed.wait_for(|c| *c) => {
                if self.connected.load(Ordering::SeqCst) {
                    Err(McpError::ConnectionClosed("mock server died".into()))
                } else {
                    Err(McpError::Cancelled("mock transport disconnected".into()))
                }
            }
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> McpResult<()> {
        if self.alive() {
            Ok(())
        } else {
            Err(McpError::ConnectionClosed("mock server is gone".into()))
        }
    }

    fn is_connected(&self) -> bool {
        self.alive()
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn pending_count(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }
}

/// Factory handing out [`MockTransport`]s keyed by server name
#[derive(Default)]
pub struct MockFactory {
    states: Mutex<HashMap<String, Arc<MockState>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a server with the given tools and return its shared state
    pub fn server(&self, name: &str, tools: &[&'static str]) -> Arc<MockState> {
        let state = MockState::new(tools);
        self.states.lock().insert(name.to_string(), state.clone());
        state
    }

    pub fn state(&self, name: &str) -> Option<Arc<MockState>> {
        self.states.lock().get(name).cloned()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, server: &ServerName, _config: &ServerConfig) -> McpResult<Arc<dyn Transport>> {
        let state = self
            .states
            .lock()
            .entry(server.to_string())
            .or_insert_with(|| MockState::new(&["echo"]))
            .clone();
        Ok(Arc::new(MockTransport::new(state)))
    }
}
