//! mcp-hub: MCP (Model Context Protocol) connection manager
//!
//! Connects to any number of MCP servers over stdio, HTTP, streamable HTTP or
//! SSE, supervises those connections, and exposes their tools, prompts and
//! resources through one typed API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  LegacyMcpManager                       │
//! │  - &str names in, anyhow::Result out                    │
//! └─────────────────┬───────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     McpManager                          │
//! │  - Server lifecycle, reconnection, token budgets        │
//! │  - CapabilityRegistry (tools / prompts / resources)     │
//! │  - EventBus (serverAdded, token-warning, ...)           │
//! └─────────────────┬───────────────────────────────────────┘
//!                   │
//!          ┌────────┴────────┐
//!          │                 │
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │ServerConnection │ │ServerConnection │
//! │  (github)       │ │  (search)       │
//! │  state + guard  │ │  state + guard  │
//! └────────┬────────┘ └────────┬────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  StdioTransport │ │  HttpTransport  │
//! └────────┬────────┘ └────────┬────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  MCP Server     │ │  MCP Server     │
//! │  (npx github)   │ │  (https://...)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcp_hub::{McpManager, ManagerOptions, ServerConfig, ToolName};
//!
//! let manager = McpManager::new(ManagerOptions::default());
//!
//! let config = ServerConfig::stdio("github", "npx")
//!     .with_args(["-y", "@modelcontextprotocol/server-github"])
//!     .with_env("GITHUB_TOKEN", "${GITHUB_TOKEN}");
//! manager.add_server(config).await?;
//!
//! let output = manager
//!     .call_tool(&ToolName::new("github/search_repositories")?, json!({"query": "mcp"}))
//!     .await?;
//!
//! manager.shutdown().await?;
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [[servers]]
//! name = "github"
//! token_limit = 100000
//!
//! [servers.transport]
//! type = "stdio"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-github"]
//! env = { GITHUB_TOKEN = "${GITHUB_TOKEN}" }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod facade;
pub mod ids;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod tokens;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod mock;

pub use client::{Discovery, McpClient};
pub use config::{McpConfig, ServerConfig, TransportConfig};
pub use connection::ServerStatus;
pub use error::{ErrorCategory, McpError, McpResult};
pub use events::{EventBus, EventKind, McpEvent, SubscriptionId};
pub use facade::{HandlerId, LegacyMcpManager};
pub use ids::{ServerName, ToolName};
pub use manager::{InitReport, ManagerOptions, McpManager, ReconcileReport, ShutdownReport};
pub use protocol::ToolOutput;
pub use registry::{PromptRecord, ResourceRecord, ToolRecord};
pub use state::{ConnectionState, RetryPolicy};
pub use tokens::{TokenLimitPolicy, TokenUsage};
pub use transport::{Framing, Transport, TransportFactory, TransportType};
pub use watcher::{ConfigChangeEvent, ConfigWatcher};
