//! Hot-reload support for MCP config files
//!
//! Watches a config file and applies changes to a running manager.

use crate::config::McpConfig;
use crate::manager::{McpManager, ReconcileReport};
use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Change observed on the watched config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    Modified(PathBuf),
    Created(PathBuf),
    Deleted(PathBuf),
}

impl ConfigChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Modified(path) | Self::Created(path) | Self::Deleted(path) => path,
        }
    }
}

/// Watcher for one config file
///
/// The parent directory is watched so that editors replacing the file
/// (write to temp, rename over) are still seen.
pub struct ConfigWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<notify::Result<Event>>,
    path: PathBuf,
    watching: bool,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Result<Self> {
        let (tx, rx) = channel();

        let watcher = RecommendedWatcher::new(
            move |result| {
                let _ = tx.send(result);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        Ok(Self {
            watcher,
            receiver: rx,
            path: path.to_path_buf(),
            watching: false,
        })
    }

    fn watch_root(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Start watching the config file
    pub fn start(&mut self) -> Result<()> {
        let root = self.watch_root().to_path_buf();
        self.watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        self.watching = true;
        info!(path = ?self.path, "Started watching MCP config for changes");
        Ok(())
    }

    /// Stop watching
    pub fn stop(&mut self) -> Result<()> {
        if self.watching {
            let root = self.watch_root().to_path_buf();
            self.watcher.unwatch(&root)?;
            self.watching = false;
            info!("Stopped watching MCP config");
        }
        Ok(())
    }

    /// Check for pending change events (non-blocking)
    pub fn poll_events(&self) -> Vec<ConfigChangeEvent> {
        let mut events = Vec::new();

        while let Ok(result) = self.receiver.try_recv() {
            match result {
                Ok(event) => events.extend(self.process_event(event)),
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        }

        events
    }

    /// Wait up to `timeout` for the next relevant change
    pub fn wait_for_event(&self, timeout: Duration) -> Option<ConfigChangeEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(Ok(event)) => {
                    if let Some(change) = self.process_event(event) {
                        return Some(change);
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "File watcher error"),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    fn process_event(&self, event: Event) -> Option<ConfigChangeEvent> {
        let file_name = self.path.file_name()?;
        if !event.paths.iter().any(|p| p.file_name() == Some(file_name)) {
            return None;
        }

        let change = match event.kind {
            EventKind::Modify(_) => ConfigChangeEvent::Modified(self.path.clone()),
            EventKind::Create(_) => ConfigChangeEvent::Created(self.path.clone()),
            EventKind::Remove(_) => ConfigChangeEvent::Deleted(self.path.clone()),
            _ => return None,
        };
        debug!(change = ?change, "MCP config changed");
        Some(change)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Re-read `path` and bring `manager` in line with it
///
/// A missing file means no servers.
pub async fn reload(manager: &McpManager, path: &Path) -> Result<ReconcileReport> {
    let servers = if path.exists() {
        McpConfig::load_from(path)?.servers
    } else {
        debug!(path = ?path, "MCP config removed; dropping all servers");
        Vec::new()
    };

    let report = manager
        .reconcile(servers)
        .await
        .context("Failed to apply reloaded MCP config")?;

    info!(
        added = report.added.len(),
        removed = report.removed.len(),
        restarted = report.restarted.len(),
        failed = report.failed.len(),
        "MCP config reloaded"
    );
    for (server, err) in &report.failed {
        warn!(server = %server, error = %err, "MCP server failed during reload");
    }
    Ok(report)
}
