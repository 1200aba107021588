//! MCP server configuration parsing
//!
//! Supports a TOML config file (`mcp.toml` or the `[mcp]` table of the global
//! config), YAML frontmatter, and `${VAR}` / `${VAR:-default}` expansion.

use crate::error::{McpError, McpResult};
use crate::ids::ServerName;
use crate::state::RetryPolicy;
use crate::tokens::{TokenLimitPolicy, DEFAULT_WARNING_RATIO};
use crate::transport::framing::Framing;
use crate::transport::TransportType;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the project tree
pub const PROJECT_CONFIG_FILE: &str = "mcp.toml";

/// How many parent directories are searched for [`PROJECT_CONFIG_FILE`]
const MAX_CONFIG_SEARCH_DEPTH: usize = 10;

const ACCEPT_HEADER: &str = "accept";
const CONTENT_TYPE_HEADER: &str = "content-type";

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var regex")
});

/// Wire-level connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(default)]
        framing: Framing,
    },
    /// Plain JSON-RPC over HTTP POST
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Legacy SSE stream plus POST endpoint
    Sse {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Streamable HTTP with session tracking
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    /// Stdio config with default framing
    pub fn stdio(command: impl Into<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            framing: Framing::default(),
        }
    }

    pub fn transport_type(&self) -> TransportType {
        match self {
            Self::Stdio { .. } => TransportType::Stdio,
            Self::Http { .. } => TransportType::Http,
            Self::Sse { .. } => TransportType::Sse,
            Self::StreamableHttp { .. } => TransportType::StreamableHttp,
        }
    }

    fn expand_env_vars(&mut self) -> Result<()> {
        match self {
            Self::Stdio { args, env, .. } => {
                for arg in args.iter_mut() {
                    *arg = expand_env_string(arg)?;
                }
                for value in env.values_mut() {
                    *value = expand_env_string(value)?;
                }
            }
            Self::Http { url, headers }
            | Self::Sse { url, headers }
            | Self::StreamableHttp { url, headers } => {
                *url = expand_env_string(url)?;
                for value in headers.values_mut() {
                    *value = expand_env_string(value)?;
                }
            }
        }
        Ok(())
    }
}

/// Configuration for an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name for this server
    pub name: String,
    /// Disabled servers are tracked but never connected
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub transport: TransportConfig,
    /// Time allowed for connect + handshake + discovery
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Time allowed for a single request
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Suppress the server's diagnostic output
    #[serde(default)]
    pub quiet: bool,
    /// Only expose these tools when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Hard limit on tokens consumed through this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u64>,
    /// Fraction of `token_limit` at which a warning is emitted
    #[serde(default = "default_warning_ratio")]
    pub token_warning_ratio: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_init_timeout_ms() -> u64 {
    30_000
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_warning_ratio() -> f64 {
    DEFAULT_WARNING_RATIO
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            transport,
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            quiet: false,
            allowed_tools: None,
            token_limit: None,
            token_warning_ratio: DEFAULT_WARNING_RATIO,
        }
    }

    /// Stdio server with the given command
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, TransportConfig::stdio(command))
    }

    /// Add arguments (stdio only)
    pub fn with_args(mut self, new_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let TransportConfig::Stdio { args, .. } = &mut self.transport {
            args.extend(new_args.into_iter().map(Into::into));
        }
        self
    }

    /// Add an environment variable (stdio only)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Set framing (stdio only)
    pub fn with_framing(mut self, new_framing: Framing) -> Self {
        if let TransportConfig::Stdio { framing, .. } = &mut self.transport {
            *framing = new_framing;
        }
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_token_limit(mut self, limit: u64) -> Self {
        self.token_limit = Some(limit);
        self
    }

    pub fn with_allowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Whether a discovered tool passes the allow-list
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|t| t == tool))
    }

    /// Check the config and return its validated name
    pub fn validate(&self) -> McpResult<ServerName> {
        let name = ServerName::new(self.name.as_str())?;

        if self.init_timeout_ms == 0 {
            return Err(McpError::invalid_config(&self.name, "init_timeout_ms must be > 0"));
        }
        if self.call_timeout_ms == 0 {
            return Err(McpError::invalid_config(&self.name, "call_timeout_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.token_warning_ratio) {
            return Err(McpError::invalid_config(
                &self.name,
                "token_warning_ratio must be between 0 and 1",
            ));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::invalid_config(&self.name, "command must not be empty"));
                }
            }
            TransportConfig::Http { url, headers }
            | TransportConfig::Sse { url, headers }
            | TransportConfig::StreamableHttp { url, headers } => {
                let parsed = url::Url::parse(url).map_err(|e| {
                    McpError::invalid_config(&self.name, format!("invalid url '{}': {}", url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::invalid_config(
                        &self.name,
                        format!("unsupported url scheme '{}'", parsed.scheme()),
                    ));
                }
                for key in headers.keys() {
                    if reqwest::header::HeaderName::from_bytes(key.as_bytes()).is_err() {
                        return Err(McpError::invalid_config(
                            &self.name,
                            format!("invalid header name '{}'", key),
                        ));
                    }
                    let lower = key.to_ascii_lowercase();
                    if lower == ACCEPT_HEADER || lower == CONTENT_TYPE_HEADER {
                        tracing::warn!(
                            server = %self.name,
                            header = %key,
                            "Custom header is ignored; it is negotiated by the transport"
                        );
                    }
                }
            }
        }

        Ok(name)
    }

    /// Expand environment variables in config values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        self.transport
            .expand_env_vars()
            .with_context(|| format!("Failed to expand variables for MCP server '{}'", self.name))
    }
}

/// Expand `${VAR}` and `${VAR:-default}` patterns using environment variables
pub fn expand_env_string(s: &str) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut last = 0;

    for cap in ENV_VAR_RE.captures_iter(s) {
        let Some(whole) = cap.get(0) else { continue };
        result.push_str(&s[last..whole.start()]);

        let var_name = &cap[1];
        let value = match std::env::var(var_name) {
            Ok(value) if !value.is_empty() => value,
            other => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => other
                    .with_context(|| format!("Environment variable {} not set", var_name))?,
            },
        };
        result.push_str(&value);
        last = whole.end();
    }

    result.push_str(&s[last..]);
    Ok(result)
}

/// MCP configuration: server list plus manager-wide settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Reconnection backoff
    #[serde(default)]
    pub retry: RetryPolicy,
    /// What happens once a server exceeds its token limit
    #[serde(default)]
    pub token_limit_policy: TokenLimitPolicy,
}

impl McpConfig {
    /// Parse a TOML document
    ///
    /// Accepts either top-level `servers` or an `[mcp]` table.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(content).context("Failed to parse MCP config")?;
        let section = value.get("mcp").cloned().unwrap_or(value);
        let config: McpConfig = section
            .try_into()
            .context("Failed to parse MCP server configuration")?;
        Ok(config)
    }

    /// Load a config file, expanding environment variables
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read MCP config from {:?}", path))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid MCP config in {:?}", path))?;
        config.expand_env_vars()?;
        Ok(config)
    }

    /// Path of the global config file
    pub fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mcp-hub").join("config.toml"))
    }

    /// Load from global config file; missing file yields the default
    pub fn load_global() -> Result<Self> {
        let config_path = Self::global_path().context("Could not determine config directory")?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Merge project-level servers; project entries win on name clashes
    pub fn merge_with_project(&mut self, project_servers: Vec<ServerConfig>) {
        let project_names: HashSet<_> = project_servers.iter().map(|s| s.name.clone()).collect();

        let mut merged = project_servers;

        for server in &self.servers {
            if !project_names.contains(&server.name) {
                merged.push(server.clone());
            }
        }

        self.servers = merged;
    }

    pub fn expand_env_vars(&mut self) -> Result<()> {
        for server in &mut self.servers {
            server.expand_env_vars()?;
        }
        Ok(())
    }

    /// Server configs that are enabled
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

/// Search `start` and its parents for [`PROJECT_CONFIG_FILE`]
pub fn find_project_config(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    let mut depth = 0;

    while let Some(dir) = current {
        let candidate = dir.join(PROJECT_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        depth += 1;
        if depth >= MAX_CONFIG_SEARCH_DEPTH {
            break;
        }
        current = dir.parent();
    }

    None
}

/// Parse MCP servers from markdown YAML frontmatter
pub fn parse_servers_from_frontmatter(yaml_str: &str) -> Result<Vec<ServerConfig>> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(yaml_str).context("Failed to parse YAML frontmatter")?;

    let servers = value
        .get("mcp_servers")
        .cloned()
        .unwrap_or(serde_yaml::Value::Sequence(vec![]));

    let configs: Vec<ServerConfig> =
        serde_yaml::from_value(servers).context("Failed to parse mcp_servers configuration")?;

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_string() {
        std::env::set_var("MCP_HUB_TEST_VAR", "hello");
        let result = expand_env_string("prefix_${MCP_HUB_TEST_VAR}_suffix").unwrap();
        assert_eq!(result, "prefix_hello_suffix");
    }

    #[test]
    fn test_expand_env_default() {
        std::env::remove_var("MCP_HUB_UNSET_VAR");
        assert_eq!(
            expand_env_string("${MCP_HUB_UNSET_VAR:-fallback}/x").unwrap(),
            "fallback/x"
        );
        assert!(expand_env_string("${MCP_HUB_UNSET_VAR}").is_err());
        assert_eq!(expand_env_string("no vars").unwrap(), "no vars");
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
token_limit_policy = "warn_only"

[retry]
base_delay_ms = 100
max_attempts = 3

[[servers]]
name = "fs"
token_limit = 1000

[servers.transport]
type = "stdio"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "."]

[[servers]]
name = "remote"
enabled = false

[servers.transport]
type = "streamable_http"
url = "https://mcp.example.com/mcp"
headers = { Authorization = "Bearer abc" }
"#;
        let config = McpConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.token_limit_policy, TokenLimitPolicy::WarnOnly);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 30_000);

        let fs = &config.servers[0];
        assert!(fs.enabled);
        assert_eq!(fs.init_timeout_ms, 30_000);
        assert_eq!(fs.token_limit, Some(1000));
        match &fs.transport {
            TransportConfig::Stdio { framing, args, .. } => {
                assert_eq!(*framing, Framing::ContentLength);
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected transport {:?}", other),
        }

        let remote = &config.servers[1];
        assert!(!remote.enabled);
        assert_eq!(remote.transport.transport_type(), TransportType::StreamableHttp);
        assert_eq!(config.enabled_servers().count(), 1);
    }

    #[test]
    fn test_parse_mcp_table() {
        let toml = r#"
[mcp]
[[mcp.servers]]
name = "github"
transport = { type = "sse", url = "http://localhost:8080/sse" }
"#;
        let config = McpConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.servers[0].name, "github");
        assert_eq!(config.servers[0].transport.transport_type(), TransportType::Sse);
    }

    #[test]
    fn test_parse_frontmatter() {
        let yaml = r#"
mcp_servers:
  - name: "github"
    transport:
      type: stdio
      command: "npx"
      args: ["-y", "@modelcontextprotocol/server-github"]
      framing: ndjson
      env:
        GITHUB_TOKEN: "test-token"
"#;
        let servers = parse_servers_from_frontmatter(yaml).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "github");
        match &servers[0].transport {
            TransportConfig::Stdio {
                command,
                framing,
                env,
                ..
            } => {
                assert_eq!(command, "npx");
                assert_eq!(*framing, Framing::Ndjson);
                assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("test-token"));
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert!(parse_servers_from_frontmatter("title: x").unwrap().is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::stdio("fs", "cat").validate().is_ok());
        assert!(matches!(
            ServerConfig::stdio("bad name", "cat").validate(),
            Err(McpError::InvalidServerName { .. })
        ));
        assert!(matches!(
            ServerConfig::stdio("fs", " ").validate(),
            Err(McpError::InvalidConfig { .. })
        ));
        let http = ServerConfig::new(
            "web",
            TransportConfig::Http {
                url: "ftp://example.com".into(),
                headers: BTreeMap::new(),
            },
        );
        assert!(http.validate().is_err());
        let zero = ServerConfig::stdio("fs", "cat").with_call_timeout(Duration::ZERO);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_merge_with_project() {
        let mut global = McpConfig {
            servers: vec![
                ServerConfig::stdio("fs", "global-fs"),
                ServerConfig::stdio("git", "global-git"),
            ],
            ..Default::default()
        };
        global.merge_with_project(vec![ServerConfig::stdio("fs", "project-fs")]);

        assert_eq!(global.servers.len(), 2);
        assert_eq!(global.servers[0].transport, TransportConfig::stdio("project-fs"));
        assert_eq!(global.servers[1].name, "git");
    }

    #[test]
    fn test_find_project_config() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), "servers = []").unwrap();

        let found = find_project_config(&nested).unwrap();
        assert_eq!(found, dir.path().join(PROJECT_CONFIG_FILE));

        let config = McpConfig::load_from(&found).unwrap();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_allow_list() {
        let config = ServerConfig::stdio("fs", "cat").with_allowed_tools(["read"]);
        assert!(config.allows_tool("read"));
        assert!(!config.allows_tool("write"));
        assert!(ServerConfig::stdio("fs", "cat").allows_tool("anything"));
    }
}
