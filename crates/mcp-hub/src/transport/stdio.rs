//! Stdio transport for MCP servers running as child processes

use super::framing::{FrameCodec, FrameError, Framing};
use super::pending::PendingCalls;
use super::{Transport, TransportType};
use crate::error::{McpError, McpResult, METHOD_NOT_FOUND};
use crate::ids::ServerName;
use crate::protocol::{error_reply, notification, IncomingMessage, JsonRpcRequest};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

/// How long `disconnect` waits for the child to exit after killing it
const KILL_GRACE: Duration = Duration::from_secs(5);

type FrameWriter = Arc<tokio::sync::Mutex<FramedWrite<ChildStdin, FrameCodec>>>;

/// Live process state, present between `connect` and `disconnect`
struct StdioLink {
    writer: FrameWriter,
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Stdio transport for MCP servers running as child processes
pub struct StdioTransport {
    server: ServerName,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    framing: Framing,
    quiet: bool,
    pending: Arc<PendingCalls>,
    link: Mutex<Option<StdioLink>>,
    connected: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl StdioTransport {
    pub fn new(server: ServerName, command: impl Into<String>, framing: Framing) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            server,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            framing,
            quiet: false,
            pending: Arc::new(PendingCalls::new()),
            link: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            closed_tx: Arc::new(closed_tx),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Suppress stderr passthrough
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn spawn_child(&self) -> McpResult<Child> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| McpError::TransportSetup {
            transport: "stdio",
            reason: format!("failed to spawn '{}': {}", self.command, e),
        })
    }

    fn writer(&self) -> McpResult<FrameWriter> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or_else(|| {
                McpError::ConnectionClosed(format!("stdio transport for '{}' is not open", self.server))
            })
    }

    async fn write(&self, writer: &FrameWriter, message: Value) -> McpResult<()> {
        writer.lock().await.send(message).await.map_err(|e| {
            McpError::ConnectionClosed(format!("failed to write to MCP server: {}", e))
        })
    }
}

/// Shared state the background tasks need
#[derive(Clone)]
struct ReaderContext {
    server: ServerName,
    pending: Arc<PendingCalls>,
    writer: FrameWriter,
    connected: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl ReaderContext {
    async fn run(self, stdout: ChildStdout, framing: Framing) {
        let mut frames = FramedRead::new(stdout, FrameCodec::new(framing));

        let failure = loop {
            match frames.next().await {
                Some(Ok(value)) => {
                    if let Err(err) = self.dispatch(value).await {
                        break err;
                    }
                }
                Some(Err(FrameError::Malformed(reason))) => {
                    break McpError::MalformedFrame(reason);
                }
                Some(Err(FrameError::Io(e))) => {
                    break McpError::ConnectionClosed(format!("read failed: {}", e));
                }
                None => {
                    break McpError::ConnectionClosed("MCP server closed its output".to_string());
                }
            }
        };

        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(server = %self.server, error = %failure, "MCP stdio channel lost");
        }
        self.pending.close(failure);
        self.closed_tx.send_replace(true);
    }

    async fn dispatch(&self, value: Value) -> McpResult<()> {
        match IncomingMessage::classify(value)? {
            Some(IncomingMessage::Response { id, outcome }) => {
                self.pending.resolve(id, outcome);
            }
            Some(IncomingMessage::Request { id, method }) => {
                debug!(server = %self.server, method = %method, "Rejecting server-initiated request");
                let reply = error_reply(id, METHOD_NOT_FOUND, "Method not supported by client");
                if let Err(e) = self.writer.lock().await.send(reply).await {
                    return Err(McpError::ConnectionClosed(format!(
                        "failed to reply to server request: {}",
                        e
                    )));
                }
            }
            Some(IncomingMessage::Notification { method, .. }) => {
                trace!(server = %self.server, method = %method, "MCP notification");
            }
            None => {
                debug!(server = %self.server, "Ignoring message without a usable id");
            }
        }
        Ok(())
    }
}

async fn drain_stderr(server: ServerName, stderr: ChildStderr, quiet: bool) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if quiet {
            trace!(server = %server, "{}", line);
        } else {
            debug!(server = %server, "{}", line);
        }
    }
}

async fn supervise(server: ServerName, mut child: Child, kill_rx: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => debug!(server = %server, %status, "MCP server process exited"),
            Err(e) => warn!(server = %server, error = %e, "Failed to wait for MCP server process"),
        },
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                debug!(server = %server, error = %e, "Failed to kill MCP server process");
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        if self.link.lock().is_some() {
            return Ok(());
        }
        if *self.closed_tx.borrow() {
            return Err(McpError::ConnectionClosed(
                "stdio transport cannot be reopened".to_string(),
            ));
        }

        info!(
            server = %self.server,
            command = %self.command,
            framing = self.framing.as_str(),
            "Starting MCP server"
        );

        let mut child = self.spawn_child()?;

        // Child is killed on drop if any of these fail
        let stdin = child.stdin.take().ok_or_else(|| McpError::TransportSetup {
            transport: "stdio",
            reason: "failed to capture stdin of MCP server".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::TransportSetup {
            transport: "stdio",
            reason: "failed to capture stdout of MCP server".to_string(),
        })?;
        let stderr = child.stderr.take();

        let writer: FrameWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            stdin,
            FrameCodec::new(self.framing),
        )));

        self.connected.store(true, Ordering::SeqCst);

        let context = ReaderContext {
            server: self.server.clone(),
            pending: self.pending.clone(),
            writer: writer.clone(),
            connected: self.connected.clone(),
            closed_tx: self.closed_tx.clone(),
        };
        let mut tasks = vec![tokio::spawn(context.run(stdout, self.framing))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(
                self.server.clone(),
                stderr,
                self.quiet,
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(self.server.clone(), child, kill_rx));

        *self.link.lock() = Some(StdioLink {
            writer,
            kill_tx: Some(kill_tx),
            supervisor,
            tasks,
        });

        Ok(())
    }

    async fn disconnect(&self) {
        let link = self.link.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        self.pending.close(McpError::Cancelled(format!(
            "MCP server '{}' disconnected",
            self.server
        )));

        let Some(mut link) = link else {
            self.closed_tx.send_replace(true);
            return;
        };

        debug!(server = %self.server, "Stopping MCP server");

        if let Some(kill_tx) = link.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        match tokio::time::timeout(KILL_GRACE, &mut link.supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(server = %self.server, error = %e, "Supervisor task failed"),
            Err(_) => {
                warn!(server = %self.server, "MCP server did not exit in time");
                link.supervisor.abort();
            }
        }
        for task in link.tasks {
            task.abort();
        }

        self.closed_tx.send_replace(true);
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        let writer = self.writer()?;
        let (id, rx) = self.pending.register()?;

        let message = match JsonRpcRequest::new(id, method, params).to_value() {
            Ok(message) => message,
            Err(e) => {
                self.pending.remove(id);
                return Err(e);
            }
        };

        trace!(server = %self.server, id, method, "Sending MCP request");
        if let Err(e) = self.write(&writer, message).await {
            self.pending.remove(id);
            return Err(e);
        }

        self.pending.wait(id, rx, timeout, method).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let writer = self.writer()?;
        self.write(&writer, notification(method, params)).await
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

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Aborting the supervisor drops the child, which kills it
        if let Some(link) = self.link.get_mut().take() {
            link.supervisor.abort();
            for task in link.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(command: &str) -> StdioTransport {
        StdioTransport::new(ServerName::new("test").unwrap(), command, Framing::Ndjson)
    }

    #[tokio::test]
    async fn test_spawn_failure_is_setup_error() {
        let transport = transport("/nonexistent/mcp-hub-test-binary");
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, McpError::TransportSetup { transport: "stdio", .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = transport("cat");
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(*transport.closed().borrow());
    }

    #[tokio::test]
    async fn test_request_before_connect_fails() {
        let transport = transport("cat");
        let err = transport
            .request("ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_loopback_through_cat() {
        // `cat` echoes the request back, which looks like a server request.
        // Our -32601 reply is echoed as well and resolves the pending call.
        let transport = transport("cat");
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        let err = transport
            .request("tools/list", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: METHOD_NOT_FOUND, .. }));
        assert_eq!(transport.pending_count(), 0);

        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_fires_closed() {
        let transport = StdioTransport::new(
            ServerName::new("short").unwrap(),
            "true",
            Framing::ContentLength,
        );
        transport.connect().await.unwrap();
        let mut closed = transport.closed();
        tokio::time::timeout(Duration::from_secs(5), closed.wait_for(|c| *c))
            .await
            .unwrap()
            .unwrap();
        assert!(!transport.is_connected());
        transport.disconnect().await;
    }
}
