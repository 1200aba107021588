//! Correlation of in-flight requests with their responses

use crate::error::{McpError, McpResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Resolver = oneshot::Sender<McpResult<Value>>;

#[derive(Default)]
struct PendingState {
    calls: HashMap<u64, Resolver>,
    closed: Option<McpError>,
}

/// Table of requests awaiting a response
///
/// Every registered id is resolved exactly once: by a response, by a timeout
/// in [`PendingCalls::wait`], or by [`PendingCalls::close`].
pub struct PendingCalls {
    state: Mutex<PendingState>,
    next_id: AtomicU64,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a correlation id and its receiver
    pub fn register(&self) -> McpResult<(u64, oneshot::Receiver<McpResult<Value>>)> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        state.calls.insert(id, tx);
        Ok((id, rx))
    }

    /// Deliver an outcome; returns false for unknown or already-resolved ids
    pub fn resolve(&self, id: u64, outcome: McpResult<Value>) -> bool {
        let resolver = self.state.lock().calls.remove(&id);
        match resolver {
            Some(tx) => {
                // Receiver may have given up already (timeout)
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(id, "Dropping response for unknown request id");
                false
            }
        }
    }

    pub fn remove(&self, id: u64) {
        self.state.lock().calls.remove(&id);
    }

    /// Resolve every pending call with `err` and refuse new registrations
    pub fn close(&self, err: McpError) -> usize {
        let drained: Vec<Resolver> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(err.clone());
            }
            state.calls.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        if count > 0 {
            trace!(count, "Force-resolved pending MCP calls");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await the outcome for `id`, giving up after `timeout`
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<McpResult<Value>>,
        timeout: Duration,
        method: &str,
    ) -> McpResult<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed(format!(
                "request '{}' dropped without a response",
                method
            ))),
            Err(_) => {
                self.remove(id);
                Err(McpError::CallTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_routes_by_id() {
        let pending = PendingCalls::new();
        let (first, rx1) = pending.register().unwrap();
        let (second, rx2) = pending.register().unwrap();
        assert_ne!(first, second);

        // Out of order
        assert!(pending.resolve(second, Ok(json!("two"))));
        assert!(pending.resolve(first, Ok(json!("one"))));

        let timeout = Duration::from_secs(1);
        assert_eq!(
            pending.wait(first, rx1, timeout, "a").await.unwrap(),
            json!("one")
        );
        assert_eq!(
            pending.wait(second, rx2, timeout, "b").await.unwrap(),
            json!("two")
        );
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let pending = PendingCalls::new();
        let (id, _rx) = pending.register().unwrap();
        assert!(pending.resolve(id, Ok(json!(1))));
        assert!(!pending.resolve(id, Ok(json!(2))));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register().unwrap();
        let err = pending
            .wait(id, rx, Duration::from_millis(10), "tools/call")
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::CallTimeout { .. }));
        assert!(pending.is_empty());
        assert!(!pending.resolve(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_close_cancels_everything() {
        let pending = PendingCalls::new();
        let (id, rx) = pending.register().unwrap();
        assert_eq!(pending.close(McpError::Cancelled("shutdown".into())), 1);

        let err = pending
            .wait(id, rx, Duration::from_secs(1), "ping")
            .await
            .unwrap_err();
        assert_eq!(err, McpError::Cancelled("shutdown".into()));
        assert!(pending.is_closed());
        assert!(pending.register().is_err());
    }
}
