//! MCP transport layer
//!
//! Supports stdio (newline or Content-Length framing), plain HTTP, streamable
//! HTTP and legacy SSE transports behind a single [`Transport`] trait.
//!
//! A transport instance is single-use: it is connected once and disconnected
//! once. Reconnection creates a fresh instance through a [`TransportFactory`].

pub mod framing;
pub mod http;
pub mod pending;
pub mod sse;
pub mod stdio;

use crate::config::{ServerConfig, TransportConfig};
use crate::error::McpResult;
use crate::ids::ServerName;
use crate::protocol::InitializeResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use framing::{FrameCodec, Framing};
pub use http::{HttpMode, HttpTransport};
pub use pending::PendingCalls;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

/// Wire mechanism of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

impl TransportType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Establish the channel
    ///
    /// On failure nothing stays running: spawned processes are killed and
    /// background tasks aborted.
    async fn connect(&self) -> McpResult<()>;

    /// Tear the channel down; idempotent and infallible
    ///
    /// Pending requests are resolved with a cancellation error.
    async fn disconnect(&self);

    /// Send a request and wait for the correlated response
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()>;

    /// Check if transport is still connected
    fn is_connected(&self) -> bool;

    /// Flips to `true` once the channel is gone, expectedly or not
    fn closed(&self) -> watch::Receiver<bool>;

    /// Called after a successful handshake
    fn on_initialized(&self, _result: &InitializeResult) {}

    /// Requests awaiting a response
    fn pending_count(&self) -> usize {
        0
    }
}

/// Builds fresh transport instances for a server
pub trait TransportFactory: Send + Sync {
    fn create(&self, server: &ServerName, config: &ServerConfig) -> McpResult<Arc<dyn Transport>>;
}

/// Factory building the real transports from a [`TransportConfig`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, server: &ServerName, config: &ServerConfig) -> McpResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
                framing,
            } => Arc::new(
                StdioTransport::new(server.clone(), command.clone(), *framing)
                    .with_args(args.iter().cloned())
                    .with_env(env.clone())
                    .with_cwd(cwd.clone())
                    .quiet(config.quiet),
            ),
            TransportConfig::Http { url, headers } => Arc::new(HttpTransport::new(
                server.clone(),
                url,
                headers,
                HttpMode::Plain,
            )?),
            TransportConfig::StreamableHttp { url, headers } => Arc::new(HttpTransport::new(
                server.clone(),
                url,
                headers,
                HttpMode::Streamable,
            )?),
            TransportConfig::Sse { url, headers } => {
                Arc::new(SseTransport::new(server.clone(), url, headers)?)
            }
        };
        Ok(transport)
    }
}

/// Header map with the negotiated Accept/Content-Type pair that caller
/// headers cannot override
pub fn build_headers(
    transport: &'static str,
    custom: &std::collections::BTreeMap<String, String>,
) -> McpResult<reqwest::header::HeaderMap> {
    use crate::error::McpError;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

    let mut headers = HeaderMap::new();
    for (key, value) in custom {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::TransportSetup {
            transport,
            reason: format!("invalid header name '{}': {}", key, e),
        })?;
        if name == ACCEPT || name == CONTENT_TYPE {
            continue;
        }
        let value = HeaderValue::from_str(value).map_err(|e| McpError::TransportSetup {
            transport,
            reason: format!("invalid value for header '{}': {}", key, e),
        })?;
        headers.insert(name, value);
    }
    headers.insert(ACCEPT, HeaderValue::from_static(MCP_JSON_AND_SSE_ACCEPT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(MCP_JSON_CONTENT_TYPE));
    Ok(headers)
}
