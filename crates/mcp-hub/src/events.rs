//! Typed lifecycle events
//!
//! Events are published on a broadcast channel for async consumers and to a
//! table of synchronous handlers (used by the legacy facade).

use crate::ids::{ServerName, ToolName};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notification emitted by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum McpEvent {
    ServerAdded {
        server: ServerName,
        tools: Vec<ToolName>,
    },
    ServerRemoved {
        server: ServerName,
    },
    ServerError {
        server: ServerName,
        error: String,
    },
    ReconnectionScheduled {
        server: ServerName,
        attempt: u32,
        delay: Duration,
    },
    ReconnectionSucceeded {
        server: ServerName,
        attempt: u32,
    },
    ReconnectionFailed {
        server: ServerName,
        attempt: u32,
        error: String,
    },
    ServerUnhealthy {
        server: ServerName,
        attempts: u32,
        error: String,
    },
    TokenLimitExceeded {
        server: ServerName,
        used: u64,
        limit: u64,
    },
    TokenWarning {
        server: ServerName,
        used: u64,
        limit: u64,
    },
}

impl McpEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServerAdded { .. } => EventKind::ServerAdded,
            Self::ServerRemoved { .. } => EventKind::ServerRemoved,
            Self::ServerError { .. } => EventKind::ServerError,
            Self::ReconnectionScheduled { .. } => EventKind::ReconnectionScheduled,
            Self::ReconnectionSucceeded { .. } => EventKind::ReconnectionSucceeded,
            Self::ReconnectionFailed { .. } => EventKind::ReconnectionFailed,
            Self::ServerUnhealthy { .. } => EventKind::ServerUnhealthy,
            Self::TokenLimitExceeded { .. } => EventKind::TokenLimitExceeded,
            Self::TokenWarning { .. } => EventKind::TokenWarning,
        }
    }

    /// Server the event concerns
    pub fn server(&self) -> &ServerName {
        match self {
            Self::ServerAdded { server, .. }
            | Self::ServerRemoved { server }
            | Self::ServerError { server, .. }
            | Self::ReconnectionScheduled { server, .. }
            | Self::ReconnectionSucceeded { server, .. }
            | Self::ReconnectionFailed { server, .. }
            | Self::ServerUnhealthy { server, .. }
            | Self::TokenLimitExceeded { server, .. }
            | Self::TokenWarning { server, .. } => server,
        }
    }
}

/// Event discriminant, named as consumers expect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerAdded,
    ServerRemoved,
    ServerError,
    ReconnectionScheduled,
    ReconnectionSucceeded,
    ReconnectionFailed,
    ServerUnhealthy,
    TokenLimitExceeded,
    TokenWarning,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        Self::ServerAdded,
        Self::ServerRemoved,
        Self::ServerError,
        Self::ReconnectionScheduled,
        Self::ReconnectionSucceeded,
        Self::ReconnectionFailed,
        Self::ServerUnhealthy,
        Self::TokenLimitExceeded,
        Self::TokenWarning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerAdded => "serverAdded",
            Self::ServerRemoved => "serverRemoved",
            Self::ServerError => "serverError",
            Self::ReconnectionScheduled => "reconnection-scheduled",
            Self::ReconnectionSucceeded => "reconnection-succeeded",
            Self::ReconnectionFailed => "reconnection-failed",
            Self::ServerUnhealthy => "server-unhealthy",
            Self::TokenLimitExceeded => "token-limit-exceeded",
            Self::TokenWarning => "token-warning",
        }
    }

    /// Look up a kind by its wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned when registering a synchronous handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&McpEvent) + Send + Sync>;

/// Publish/subscribe hub for [`McpEvent`]s
pub struct EventBus {
    sender: broadcast::Sender<McpEvent>,
    handlers: RwLock<HashMap<SubscriptionId, (Option<EventKind>, EventHandler)>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receiver for every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.sender.subscribe()
    }

    /// Register a handler for one kind of event
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&McpEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Register a handler for all events
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&McpEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    fn insert(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().insert(id, (kind, handler));
        id
    }

    /// Detach a handler; returns false if it was not registered
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.handlers.write().remove(&id).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn emit(&self, event: McpEvent) {
        trace!(event = %event.kind(), server = %event.server(), "Emitting MCP event");

        // Handlers run outside the lock so they may call `off` themselves
        let matching: Vec<EventHandler> = {
            let handlers = self.handlers.read();
            let mut entries: Vec<_> = handlers
                .iter()
                .filter(|(_, (kind, _))| kind.map_or(true, |k| k == event.kind()))
                .map(|(id, (_, handler))| (*id, handler.clone()))
                .collect();
            entries.sort_by_key(|(id, _)| *id);
            entries.into_iter().map(|(_, handler)| handler).collect()
        };

        for handler in matching {
            handler(&event);
        }

        // No receivers is fine
        let _ = self.sender.send(event);
    }
}
