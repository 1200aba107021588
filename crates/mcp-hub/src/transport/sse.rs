//! Server-Sent Events parsing and the legacy SSE transport
//!
//! The legacy transport opens a `GET` event stream; the server announces the
//! URL to POST requests to in an `endpoint` event and delivers responses as
//! `message` events on the stream.

use super::pending::PendingCalls;
use super::{build_headers, Transport, TransportType};
use crate::error::{McpError, McpResult};
use crate::ids::ServerName;
use crate::protocol::{notification, IncomingMessage, JsonRpcRequest};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

/// How long to wait for the `endpoint` event after the stream opens
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// A dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name, `message` when the server did not set one
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser that tolerates arbitrary chunk boundaries
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventParser {
    /// Feed a chunk and return the events it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line = String::from_utf8_lossy(&self.buffer[search_index..line_end]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }

            search_index = newline_index + 1;
        }

        if search_index > 0 {
            self.buffer.drain(..search_index);
        }
        events
    }

    /// Flush a trailing event at end of stream
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if !rest.is_empty() {
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        events.extend(self.dispatch());
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// Legacy SSE transport
pub struct SseTransport {
    server: ServerName,
    url: Url,
    client: reqwest::Client,
    pending: Arc<PendingCalls>,
    endpoint: Mutex<Option<Url>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl SseTransport {
    pub fn new(
        server: ServerName,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> McpResult<Self> {
        let url = Url::parse(url).map_err(|e| McpError::TransportSetup {
            transport: "sse",
            reason: format!("invalid url '{}': {}", url, e),
        })?;
        let client = reqwest::Client::builder()
            .default_headers(build_headers("sse", headers)?)
            .build()
            .map_err(|e| McpError::TransportSetup {
                transport: "sse",
                reason: e.to_string(),
            })?;
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            server,
            url,
            client,
            pending: Arc::new(PendingCalls::new()),
            endpoint: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closed_tx: Arc::new(closed_tx),
        })
    }

    fn endpoint(&self) -> McpResult<Url> {
        self.endpoint.lock().clone().ok_or_else(|| {
            McpError::ConnectionClosed(format!("SSE transport for '{}' is not open", self.server))
        })
    }

    async fn post(&self, endpoint: Url, body: &Value) -> McpResult<()> {
        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(McpError::Unreachable(format!(
                "MCP server returned error status: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

struct StreamContext {
    server: ServerName,
    base: Url,
    pending: Arc<PendingCalls>,
    connected: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl StreamContext {
    async fn run(self, response: reqwest::Response, endpoint_tx: oneshot::Sender<McpResult<Url>>) {
        let mut endpoint_tx = Some(endpoint_tx);
        let mut parser = SseEventParser::default();
        let mut stream = response.bytes_stream();

        let failure = loop {
            let events = match stream.next().await {
                Some(Ok(chunk)) => parser.push(&chunk),
                Some(Err(e)) => break McpError::ConnectionClosed(format!("SSE stream error: {}", e)),
                None => {
                    for event in parser.finish() {
                        self.handle(event, &mut endpoint_tx);
                    }
                    break McpError::ConnectionClosed("SSE stream ended".to_string());
                }
            };
            for event in events {
                self.handle(event, &mut endpoint_tx);
            }
        };

        if let Some(tx) = endpoint_tx.take() {
            let _ = tx.send(Err(failure.clone()));
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(server = %self.server, error = %failure, "MCP SSE stream lost");
        }
        self.pending.close(failure);
        self.closed_tx.send_replace(true);
    }

    fn handle(&self, event: SseEvent, endpoint_tx: &mut Option<oneshot::Sender<McpResult<Url>>>) {
        match event.event.as_str() {
            "endpoint" => {
                let resolved = self.base.join(event.data.trim()).map_err(|e| {
                    McpError::MalformedFrame(format!("invalid endpoint '{}': {}", event.data, e))
                });
                match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(resolved);
                    }
                    None => debug!(server = %self.server, "Ignoring repeated endpoint event"),
                }
            }
            "message" => {
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(server = %self.server, error = %e, "Skipping non-JSON SSE message");
                        return;
                    }
                };
                match IncomingMessage::classify(value) {
                    Ok(Some(IncomingMessage::Response { id, outcome })) => {
                        self.pending.resolve(id, outcome);
                    }
                    Ok(Some(IncomingMessage::Request { method, .. })) => {
                        debug!(server = %self.server, method = %method, "Ignoring server-initiated request");
                    }
                    Ok(Some(IncomingMessage::Notification { method, .. })) => {
                        trace!(server = %self.server, method = %method, "MCP notification");
                    }
                    Ok(None) => {}
                    Err(e) => debug!(server = %self.server, error = %e, "Skipping SSE message"),
                }
            }
            other => trace!(server = %self.server, event = other, "Ignoring SSE event"),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }

    async fn connect(&self) -> McpResult<()> {
        if self.endpoint.lock().is_some() {
            return Ok(());
        }
        if *self.closed_tx.borrow() {
            return Err(McpError::ConnectionClosed(
                "SSE transport cannot be reopened".to_string(),
            ));
        }

        info!(server = %self.server, url = %self.url, "Opening MCP SSE stream");

        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(McpError::Unreachable(format!(
                "SSE endpoint returned error status: {}",
                response.status()
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let context = StreamContext {
            server: self.server.clone(),
            base: self.url.clone(),
            pending: self.pending.clone(),
            connected: self.connected.clone(),
            closed_tx: self.closed_tx.clone(),
        };
        let reader = tokio::spawn(context.run(response, endpoint_tx));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(e))) => {
                reader.abort();
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                reader.abort();
                self.connected.store(false, Ordering::SeqCst);
                return Err(McpError::TransportSetup {
                    transport: "sse",
                    reason: "server did not announce an endpoint".to_string(),
                });
            }
        };

        debug!(server = %self.server, endpoint = %endpoint, "MCP SSE endpoint announced");
        *self.endpoint.lock() = Some(endpoint);
        *self.reader.lock() = Some(reader);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.endpoint.lock().take();
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.pending.close(McpError::Cancelled(format!(
            "MCP server '{}' disconnected",
            self.server
        )));
        self.closed_tx.send_replace(true);
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        let endpoint = self.endpoint()?;
        let (id, rx) = self.pending.register()?;

        let body = match JsonRpcRequest::new(id, method, params).to_value() {
            Ok(body) => body,
            Err(e) => {
                self.pending.remove(id);
                return Err(e);
            }
        };

        let started = tokio::time::Instant::now();
        let posted = match tokio::time::timeout(timeout, self.post(endpoint, &body)).await {
            Ok(posted) => posted,
            Err(_) => Err(McpError::CallTimeout {
                method: method.to_string(),
                timeout,
            }),
        };
        if let Err(e) = posted {
            self.pending.remove(id);
            return Err(e);
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        self.pending.wait(id, rx, remaining, method).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let endpoint = self.endpoint()?;
        self.post(endpoint, &notification(method, params)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
