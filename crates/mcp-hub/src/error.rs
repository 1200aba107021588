//! Error taxonomy for the manager core
//!
//! Every fallible core operation returns [`McpResult`]. Only the legacy facade
//! turns these into `anyhow` errors.

use crate::state::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC code servers use for unsupported methods
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Coarse grouping of [`McpError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid names, duplicates, unusable config values
    Configuration,
    /// Handshake and transport-level failures
    Connection,
    /// Malformed frames, unknown tools, unexpected payloads
    Protocol,
    /// Timeouts, unreachable servers, exhausted budgets
    Runtime,
    /// Shutdown and explicit cancellation
    Cancellation,
}

/// Errors returned by the MCP manager and its transports
#[derive(Debug, Clone, Error, PartialEq)]
pub enum McpError {
    #[error("invalid server name '{value}': {reason}")]
    InvalidServerName { value: String, reason: &'static str },

    #[error("invalid tool name '{value}': {reason}")]
    InvalidToolName { value: String, reason: &'static str },

    #[error("MCP server '{0}' is already configured")]
    DuplicateServer(String),

    #[error("invalid configuration for MCP server '{server}': {reason}")]
    InvalidConfig { server: String, reason: String },

    #[error("MCP server '{0}' not found")]
    ServerNotFound(String),

    #[error("MCP server '{server}' did not finish its handshake within {timeout:?}")]
    HandshakeTimeout { server: String, timeout: Duration },

    #[error("failed to set up {transport} transport: {reason}")]
    TransportSetup {
        transport: &'static str,
        reason: String,
    },

    #[error("MCP connection closed: {0}")]
    ConnectionClosed(String),

    #[error("MCP server '{server}' is not connected (state: {state})")]
    ServerNotConnected {
        server: String,
        state: ConnectionState,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("unknown prompt '{0}'")]
    UnknownPrompt(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response payload: {0}")]
    SchemaMismatch(String),

    #[error("request '{method}' timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    #[error("MCP server unreachable: {0}")]
    Unreachable(String),

    #[error("MCP server '{server}' exceeded its token limit ({used}/{limit})")]
    TokenLimitExceeded { server: String, used: u64, limit: u64 },

    #[error("MCP server '{server}' cannot move from {from} to {to}")]
    InvalidTransition {
        server: String,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("MCP manager has been shut down")]
    ShutDown,
}

impl McpError {
    /// Category used for reporting and retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidServerName { .. }
            | Self::InvalidToolName { .. }
            | Self::DuplicateServer(_)
            | Self::InvalidConfig { .. }
            | Self::ServerNotFound(_) => ErrorCategory::Configuration,
            Self::HandshakeTimeout { .. }
            | Self::TransportSetup { .. }
            | Self::ConnectionClosed(_)
            | Self::ServerNotConnected { .. }
            | Self::InvalidTransition { .. } => ErrorCategory::Connection,
            Self::MalformedFrame(_)
            | Self::UnknownTool(_)
            | Self::UnknownPrompt(_)
            | Self::Rpc { .. }
            | Self::SchemaMismatch(_) => ErrorCategory::Protocol,
            Self::CallTimeout { .. } | Self::Unreachable(_) | Self::TokenLimitExceeded { .. } => {
                ErrorCategory::Runtime
            }
            Self::Cancelled(_) | Self::ShutDown => ErrorCategory::Cancellation,
        }
    }

    /// Whether this error means the underlying channel is no longer usable
    ///
    /// Such errors degrade the owning connection and schedule a reconnect.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::MalformedFrame(_) | Self::Unreachable(_)
        )
    }

    pub(crate) fn invalid_config(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            server: server.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used by every fallible core operation
pub type McpResult<T> = std::result::Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            McpError::DuplicateServer("fs".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            McpError::UnknownTool("echo".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            McpError::CallTimeout {
                method: "tools/call".into(),
                timeout: Duration::from_secs(1)
            }
            .category(),
            ErrorCategory::Runtime
        );
        assert_eq!(McpError::ShutDown.category(), ErrorCategory::Cancellation);
    }

    #[test]
    fn test_connection_loss() {
        assert!(McpError::ConnectionClosed("eof".into()).is_connection_loss());
        assert!(McpError::MalformedFrame("bad header".into()).is_connection_loss());
        assert!(!McpError::Rpc {
            code: -1,
            message: "boom".into()
        }
        .is_connection_loss());
        assert!(!McpError::CallTimeout {
            method: "ping".into(),
            timeout: Duration::from_millis(5)
        }
        .is_connection_loss());
    }

    #[test]
    fn test_display_mentions_state() {
        let err = McpError::ServerNotConnected {
            server: "fs".into(),
            state: ConnectionState::Degraded,
        };
        assert_eq!(
            err.to_string(),
            "MCP server 'fs' is not connected (state: degraded)"
        );
    }
}
