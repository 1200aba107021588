//! CLI commands implementation

use anyhow::{bail, Context, Result};
use mcp_hub::config::find_project_config;
use mcp_hub::watcher::{self, ConfigWatcher};
use mcp_hub::{ConnectionState, EventKind, LegacyMcpManager, McpConfig, McpEvent};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ANSI color codes
const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const YELLOW: &str = "\x1b[93m";
const BLUE: &str = "\x1b[94m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

fn print_status(ok: bool, msg: &str) {
    let icon = if ok {
        format!("{}✓{}", GREEN, RESET)
    } else {
        format!("{}✗{}", RED, RESET)
    };
    println!("  {} {}", icon, msg);
}

/// Resolve the config to use and the file it came from
///
/// An explicit path wins. Otherwise the global config is merged with the
/// nearest project `mcp.toml`.
fn load_config(explicit: Option<&Path>) -> Result<(McpConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = McpConfig::load_from(path)?;
        return Ok((config, Some(path.to_path_buf())));
    }

    let mut config = McpConfig::load_global()?;
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    match find_project_config(&cwd) {
        Some(path) => {
            let project = McpConfig::load_from(&path)?;
            config.merge_with_project(project.servers);
            Ok((config, Some(path)))
        }
        None => Ok((config, McpConfig::global_path())),
    }
}

/// Build the manager and connect every enabled server
async fn connect(config: &McpConfig) -> Result<LegacyMcpManager> {
    let hub = LegacyMcpManager::from_config(config)?;
    if config.enabled_servers().next().is_none() {
        println!("{}No MCP servers configured{}", YELLOW, RESET);
        return Ok(hub);
    }

    let report = hub.ensure_servers_initialized().await?;
    for (server, err) in &report.failed {
        print_status(false, &format!("{}: {}", server, err));
    }
    Ok(hub)
}

fn state_color(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => GREEN,
        ConnectionState::Connecting | ConnectionState::Reconnecting | ConnectionState::Degraded => {
            YELLOW
        }
        ConnectionState::Failed => RED,
        ConnectionState::Disconnected | ConnectionState::Removed => DIM,
    }
}

fn describe_event(event: &McpEvent) -> String {
    match event {
        McpEvent::ServerAdded { server, tools } => {
            format!("{} connected ({} tools)", server, tools.len())
        }
        McpEvent::ServerRemoved { server } => format!("{} removed", server),
        McpEvent::ServerError { server, error } => format!("{}: {}", server, error),
        McpEvent::ReconnectionScheduled {
            server,
            attempt,
            delay,
        } => format!("{} reconnect #{} in {:?}", server, attempt, delay),
        McpEvent::ReconnectionSucceeded { server, attempt } => {
            format!("{} reconnected after {} attempt(s)", server, attempt)
        }
        McpEvent::ReconnectionFailed {
            server,
            attempt,
            error,
        } => format!("{} reconnect #{} failed: {}", server, attempt, error),
        McpEvent::ServerUnhealthy {
            server, attempts, ..
        } => format!("{} gave up after {} attempts", server, attempts),
        McpEvent::TokenLimitExceeded { server, used, limit } => {
            format!("{} exceeded token limit ({}/{})", server, used, limit)
        }
        McpEvent::TokenWarning { server, used, limit } => {
            format!("{} nearing token limit ({}/{})", server, used, limit)
        }
    }
}

/// List configured servers without connecting
pub async fn servers(config_path: Option<&Path>) -> Result<()> {
    let (config, path) = load_config(config_path)?;

    println!("{}MCP Servers{}", BOLD, RESET);
    if let Some(path) = path {
        println!("  {}Config: {}{}", DIM, path.display(), RESET);
    }
    if config.servers.is_empty() {
        println!("  {}None configured{}", YELLOW, RESET);
        return Ok(());
    }

    for server in &config.servers {
        let enabled = if server.enabled {
            String::new()
        } else {
            format!(" {}(disabled){}", DIM, RESET)
        };
        println!(
            "  - {} [{}]{}",
            server.name,
            server.transport.transport_type(),
            enabled
        );
    }
    Ok(())
}

/// List tools of every connected server
pub async fn tools(config_path: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let hub = connect(&config).await?;
    let tools = hub.get_tools()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        println!("{}Tools ({}){}", BOLD, tools.len(), RESET);
        for tool in &tools {
            println!("  {}{}{}", BLUE, tool.qualified_name(), RESET);
            if let Some(description) = &tool.description {
                println!("    {}{}{}", DIM, description, RESET);
            }
        }
    }

    hub.shutdown().await?;
    Ok(())
}

pub async fn prompts(config_path: Option<&Path>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let hub = connect(&config).await?;
    let prompts = hub.get_prompts()?;

    println!("{}Prompts ({}){}", BOLD, prompts.len(), RESET);
    for prompt in &prompts {
        let args: Vec<String> = prompt
            .arguments
            .iter()
            .map(|arg| {
                if arg.required {
                    arg.name.clone()
                } else {
                    format!("[{}]", arg.name)
                }
            })
            .collect();
        println!(
            "  {}{}/{}{} {}",
            BLUE,
            prompt.server,
            prompt.name,
            RESET,
            args.join(" ")
        );
    }

    hub.shutdown().await?;
    Ok(())
}

pub async fn resources(config_path: Option<&Path>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let hub = connect(&config).await?;
    let resources = hub.get_resources()?;

    println!("{}Resources ({}){}", BOLD, resources.len(), RESET);
    for resource in &resources {
        let mime = resource.mime_type.as_deref().unwrap_or("unknown");
        println!(
            "  {} {}({}, {}){}",
            resource.uri, DIM, resource.server, mime, RESET
        );
    }

    hub.shutdown().await?;
    Ok(())
}

/// Show per-server connection state and token usage
pub async fn status(config_path: Option<&Path>, json: bool) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let hub = connect(&config).await?;
    let statuses = hub.get_connection_status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        println!("{}MCP Status{}", BOLD, RESET);
        for status in &statuses {
            let tokens = match status.tokens.limit {
                Some(limit) => format!("{}/{} tokens", status.tokens.used, limit),
                None => format!("{} tokens", status.tokens.used),
            };
            println!(
                "  {} {}{}{} [{}] {} tools, {}",
                status.name,
                state_color(status.state),
                status.state,
                RESET,
                status.transport,
                status.tools,
                tokens
            );
            if let Some(version) = &status.server_version {
                println!("    {}{}{}", DIM, version, RESET);
            }
            if let Some(error) = &status.last_error {
                println!("    {}{}{}", RED, error, RESET);
            }
        }
    }

    hub.shutdown().await?;
    Ok(())
}

/// Call a tool and print its output
pub async fn call(config_path: Option<&Path>, tool: &str, args: &str) -> Result<()> {
    let arguments: Value =
        serde_json::from_str(args).with_context(|| format!("Invalid JSON arguments: {}", args))?;
    if !arguments.is_object() {
        bail!("Tool arguments must be a JSON object");
    }

    let (config, _) = load_config(config_path)?;
    let hub = connect(&config).await?;
    let result = hub.call_tool(tool, arguments).await;
    hub.shutdown().await?;

    let output = result?;
    println!("{}", output.output);
    if let Some(structured) = &output.structured {
        println!("{}", serde_json::to_string_pretty(structured)?);
    }
    if !output.success {
        bail!("Tool '{}' reported an error", tool);
    }
    Ok(())
}

/// Keep servers connected and reconcile on config changes until Ctrl-C
pub async fn watch(config_path: Option<&Path>) -> Result<()> {
    let (config, path) = load_config(config_path)?;
    let path = path.context("No config file to watch")?;

    let hub = LegacyMcpManager::from_config(&config)?;
    for kind in EventKind::ALL {
        hub.on(kind.as_str(), |event| {
            println!("{}[{}]{} {}", DIM, event.kind(), RESET, describe_event(event));
        })?;
    }
    if let Err(e) = hub.ensure_servers_initialized().await {
        print_status(false, &format!("{:#}", e));
    }

    let mut config_watcher = ConfigWatcher::new(&path)?;
    config_watcher.start()?;
    println!(
        "{}Watching {} (Ctrl-C to stop){}",
        BOLD,
        path.display(),
        RESET
    );

    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                if config_watcher.poll_events().is_empty() {
                    continue;
                }
                match watcher::reload(hub.manager(), &path).await {
                    Ok(report) if report.is_empty() => {}
                    Ok(report) => print_status(
                        report.failed.is_empty(),
                        &format!(
                            "Reloaded: {} added, {} removed, {} restarted, {} failed",
                            report.added.len(),
                            report.removed.len(),
                            report.restarted.len(),
                            report.failed.len()
                        ),
                    ),
                    Err(e) => print_status(false, &format!("{:#}", e)),
                }
            }
        }
    }

    config_watcher.stop()?;
    let report = hub.shutdown().await?;
    println!(
        "{}Stopped {} server(s), cancelled {} call(s){}",
        DIM, report.servers, report.cancelled_calls, RESET
    );
    Ok(())
}
