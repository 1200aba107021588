//! HTTP transports for remote MCP servers
//!
//! [`HttpMode::Plain`] posts each JSON-RPC message to a fixed URL.
//! [`HttpMode::Streamable`] additionally tracks the `Mcp-Session-Id` the
//! server assigns, sends `MCP-Protocol-Version` after the handshake and ends
//! the session with `DELETE` on disconnect. Either mode accepts a JSON body
//! or an SSE stream in response, whichever the server picks.

use super::sse::SseEventParser;
use super::{build_headers, Transport, TransportType};
use crate::error::{McpError, McpResult};
use crate::ids::ServerName;
use crate::protocol::{notification, IncomingMessage, InitializeResult, JsonRpcRequest};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

pub const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Time allowed for the session `DELETE` on disconnect
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    Plain,
    Streamable,
}

/// Whether a Content-Type denotes an SSE stream
pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

/// HTTP transport for remote MCP servers
pub struct HttpTransport {
    server: ServerName,
    url: Url,
    mode: HttpMode,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Decrements the in-flight counter when a request finishes
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpTransport {
    pub fn new(
        server: ServerName,
        url: &str,
        headers: &BTreeMap<String, String>,
        mode: HttpMode,
    ) -> McpResult<Self> {
        let label = match mode {
            HttpMode::Plain => "http",
            HttpMode::Streamable => "streamable_http",
        };
        let url = Url::parse(url).map_err(|e| McpError::TransportSetup {
            transport: label,
            reason: format!("invalid url '{}': {}", url, e),
        })?;
        let client = reqwest::Client::builder()
            .default_headers(build_headers(label, headers)?)
            .build()
            .map_err(|e| McpError::TransportSetup {
                transport: label,
                reason: e.to_string(),
            })?;
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            server,
            url,
            mode,
            client,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed_tx,
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn ensure_open(&self) -> McpResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(McpError::ConnectionClosed(format!(
                "HTTP transport for '{}' is not open",
                self.server
            )))
        }
    }

    fn apply_session_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.mode != HttpMode::Streamable {
            return request;
        }
        let mut request = request;
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(MCP_SESSION_ID_HEADER, session);
        }
        match self.protocol_version.lock().clone() {
            Some(version) if !version.trim().is_empty() => {
                request.header(MCP_PROTOCOL_VERSION_HEADER, version)
            }
            _ => request,
        }
    }

    async fn post(&self, body: &Value) -> McpResult<reqwest::Response> {
        let request = self.apply_session_headers(self.client.post(self.url.clone()).json(body));
        let response = request
            .send()
            .await
            .map_err(|e| McpError::Unreachable(e.to_string()))?;

        if self.mode == HttpMode::Streamable {
            if let Some(session) = response
                .headers()
                .get(MCP_SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                let mut current = self.session_id.lock();
                if current.as_deref() != Some(session) {
                    debug!(server = %self.server, session, "MCP session assigned");
                    *current = Some(session.to_string());
                }
            }

            if response.status() == reqwest::StatusCode::NOT_FOUND && self.session_id().is_some() {
                self.connected.store(false, Ordering::SeqCst);
                self.closed_tx.send_replace(true);
                return Err(McpError::ConnectionClosed("MCP session expired".to_string()));
            }
        }

        if !response.status().is_success() {
            return Err(McpError::Unreachable(format!(
                "MCP server returned error status: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Extract the response for `id` from a JSON or SSE body
    async fn read_response(&self, id: u64, response: reqwest::Response) -> McpResult<Value> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let mut parser = SseEventParser::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| {
                    McpError::ConnectionClosed(format!("SSE response interrupted: {}", e))
                })?;
                for event in parser.push(&chunk) {
                    if let Some(outcome) = self.match_response(id, &event.data)? {
                        return outcome;
                    }
                }
            }
            for event in parser.finish() {
                if let Some(outcome) = self.match_response(id, &event.data)? {
                    return outcome;
                }
            }
            return Err(McpError::MalformedFrame(
                "event stream ended without a response".to_string(),
            ));
        }

        let text = response
            .text()
            .await
            .map_err(|e| McpError::ConnectionClosed(format!("failed to read response: {}", e)))?;
        if text.trim().is_empty() {
            return Err(McpError::SchemaMismatch(
                "empty response body for request".to_string(),
            ));
        }
        match self.match_response(id, &text)? {
            Some(outcome) => outcome,
            None => Err(McpError::SchemaMismatch(format!(
                "response did not answer request {}",
                id
            ))),
        }
    }

    /// Outcome when `data` is the response to `id`; `None` for anything else
    fn match_response(&self, id: u64, data: &str) -> McpResult<Option<McpResult<Value>>> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| McpError::MalformedFrame(format!("invalid JSON from MCP server: {}", e)))?;

        // Batched replies arrive as arrays
        let messages = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        for message in messages {
            match IncomingMessage::classify(message)? {
                Some(IncomingMessage::Response {
                    id: response_id,
                    outcome,
                }) if response_id == id => return Ok(Some(outcome)),
                Some(IncomingMessage::Notification { method, .. }) => {
                    trace!(server = %self.server, method = %method, "MCP notification");
                }
                Some(other) => {
                    debug!(server = %self.server, message = ?other, "Ignoring unrelated MCP message");
                }
                None => {}
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        match self.mode {
            HttpMode::Plain => TransportType::Http,
            HttpMode::Streamable => TransportType::StreamableHttp,
        }
    }

    async fn connect(&self) -> McpResult<()> {
        if *self.closed_tx.borrow() {
            return Err(McpError::ConnectionClosed(
                "HTTP transport cannot be reopened".to_string(),
            ));
        }
        // Stateless until the handshake; reachability shows up there
        self.connected.store(true, Ordering::SeqCst);
        debug!(server = %self.server, url = %self.url, mode = ?self.mode, "MCP HTTP transport ready");
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            self.closed_tx.send_replace(true);
            return;
        }

        if self.mode == HttpMode::Streamable {
            let session = self.session_id.lock().take();
            if let Some(session) = session {
                let request = self
                    .client
                    .delete(self.url.clone())
                    .header(MCP_SESSION_ID_HEADER, session);
                match tokio::time::timeout(SESSION_CLOSE_TIMEOUT, request.send()).await {
                    Ok(Ok(response)) => {
                        trace!(server = %self.server, status = %response.status(), "MCP session closed")
                    }
                    Ok(Err(e)) => debug!(server = %self.server, error = %e, "Failed to close MCP session"),
                    Err(_) => debug!(server = %self.server, "Timed out closing MCP session"),
                }
            }
        }

        // Wakes in-flight requests
        self.closed_tx.send_replace(true);
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        self.ensure_open()?;
        let _in_flight = InFlight::enter(&self.in_flight);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = JsonRpcRequest::new(id, method, params).to_value()?;
        let mut closed = self.closed_tx.subscribe();

        let exchange = async {
            let response = self.post(&body).await?;
            self.read_response(id, response).await
        };

        tokio::select! {
            outcome = tokio::time::timeout(timeout, exchange) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                }),
            },
            _ = closed.wait_for(|closed| *closed) => Err(McpError::Cancelled(format!(
                "MCP server '{}' disconnected",
                self.server
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.ensure_open()?;
        self.post(&notification(method, params)).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn on_initialized(&self, result: &InitializeResult) {
        if self.mode == HttpMode::Streamable && !result.protocol_version.is_empty() {
            *self.protocol_version.lock() = Some(result.protocol_version.clone());
        }
    }

    fn pending_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerCapabilities, ServerInfo};
    use std::sync::Arc;

    fn transport(mode: HttpMode) -> HttpTransport {
        HttpTransport::new(
            ServerName::new("remote").unwrap(),
            "http://127.0.0.1:9/mcp",
            &BTreeMap::new(),
            mode,
        )
        .unwrap()
    }

    #[test]
    fn test_detects_event_stream_content_type() {
        assert!(is_event_stream_content_type("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn test_match_response_by_id() {
        let transport = transport(HttpMode::Plain);
        let outcome = transport
            .match_response(3, r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome["ok"], true);

        assert!(transport
            .match_response(4, r#"{"jsonrpc":"2.0","id":3,"result":{}}"#)
            .unwrap()
            .is_none());
        assert!(transport.match_response(1, "not json").is_err());
    }

    #[test]
    fn test_match_response_in_batch() {
        let transport = transport(HttpMode::Plain);
        let data = r#"[{"jsonrpc":"2.0","method":"notifications/progress"},
                       {"jsonrpc":"2.0","id":7,"error":{"code":-32602,"message":"bad"}}]"#;
        let outcome = transport.match_response(7, data).unwrap().unwrap();
        assert!(matches!(outcome, Err(McpError::Rpc { code: -32602, .. })));
    }

    #[test]
    fn test_protocol_version_only_for_streamable() {
        let result = InitializeResult {
            protocol_version: "2025-03-26".into(),
            capabilities: ServerCapabilities::default(),
            server_info: ServerInfo {
                name: "x".into(),
                version: None,
            },
        };
        let plain = transport(HttpMode::Plain);
        plain.on_initialized(&result);
        assert!(plain.protocol_version.lock().is_none());

        let streamable = transport(HttpMode::Streamable);
        streamable.on_initialized(&result);
        assert_eq!(
            streamable.protocol_version.lock().as_deref(),
            Some("2025-03-26")
        );
    }

    #[tokio::test]
    async fn test_request_requires_connect() {
        let transport = transport(HttpMode::Streamable);
        let err = transport
            .request("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_disconnect_ends_session_from_spawned_task() {
        let transport = Arc::new(transport(HttpMode::Streamable));
        transport.connect().await.unwrap();
        *transport.session_id.lock() = Some("session-1".into());
        let mut closed = transport.closed();

        let closing = tokio::spawn({
            let transport = transport.clone();
            async move { transport.disconnect().await }
        });
        tokio::time::timeout(Duration::from_secs(5), closing)
            .await
            .unwrap()
            .unwrap();

        assert!(transport.session_id().is_none());
        assert!(!transport.is_connected());
        assert!(*closed.borrow_and_update());
    }

    #[tokio::test]
    async fn test_unreachable_after_connect() {
        let transport = transport(HttpMode::Plain);
        transport.connect().await.unwrap();
        let err = transport
            .request("ping", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_connection_loss());
        assert_eq!(transport.pending_count(), 0);
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(transport.connect().await.is_err());
    }
}
