//! Validated identifiers for servers and tools
//!
//! Both types can only be built through [`ServerName::new`] / [`ToolName::new`]
//! (or the `FromStr`/`TryFrom`/serde paths that delegate to them).

use crate::error::{McpError, McpResult};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

const MAX_SERVER_NAME_LEN: usize = 64;
const MAX_TOOL_NAME_LEN: usize = 128;

/// Separators accepted in qualified tool references (`server/tool`, `server__tool`)
pub const QUALIFIED_SEPARATORS: [&str; 2] = ["/", "__"];

fn check_name(
    value: &str,
    max_len: usize,
    extra_allowed: &[char],
) -> std::result::Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > max_len {
        return Err("is too long");
    }
    if value.trim() != value {
        return Err("must not have surrounding whitespace");
    }
    let valid = value.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') || extra_allowed.contains(&c)
    });
    if !valid {
        return Err("contains characters outside [A-Za-z0-9_.-]");
    }
    Ok(())
}

/// Name of a configured MCP server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerName(String);

impl ServerName {
    /// Validate and wrap a server name
    pub fn new(value: impl Into<String>) -> McpResult<Self> {
        let value = value.into();
        match check_name(&value, MAX_SERVER_NAME_LEN, &[]) {
            Ok(()) => Ok(Self(value)),
            Err(reason) => Err(McpError::InvalidServerName { value, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a tool as reported by its server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolName(String);

impl ToolName {
    /// Validate and wrap a tool name
    ///
    /// Tool names may contain `/` so that qualified references such as
    /// `github/create_issue` validate as well.
    pub fn new(value: impl Into<String>) -> McpResult<Self> {
        let value = value.into();
        match check_name(&value, MAX_TOOL_NAME_LEN, &['/']) {
            Ok(()) => Ok(Self(value)),
            Err(reason) => Err(McpError::InvalidToolName { value, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a qualified reference into server and tool parts
    ///
    /// Returns `None` for bare names or when either side is not a valid name.
    pub fn split_qualified(&self) -> Option<(ServerName, ToolName)> {
        QUALIFIED_SEPARATORS.iter().find_map(|sep| {
            let (server, tool) = self.0.split_once(sep)?;
            Some((ServerName::new(server).ok()?, ToolName::new(tool).ok()?))
        })
    }
}

macro_rules! impl_name_traits {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $ty {
            type Err = McpError;

            fn from_str(s: &str) -> McpResult<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = McpError;

            fn try_from(value: String) -> McpResult<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = McpError;

            fn try_from(value: &str) -> McpResult<Self> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                value.0
            }
        }
    };
}

impl_name_traits!(ServerName);
impl_name_traits!(ToolName);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_common_names() {
        for name in ["github", "fs-local", "my_server.v2", "A1"] {
            assert!(ServerName::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_server_name_rejects_invalid() {
        assert!(matches!(
            ServerName::new(""),
            Err(McpError::InvalidServerName { reason: "must not be empty", .. })
        ));
        assert!(ServerName::new(" padded ").is_err());
        assert!(ServerName::new("has space").is_err());
        assert!(ServerName::new("slash/name").is_err());
        assert!(ServerName::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_tool_name_allows_slash() {
        let tool = ToolName::new("github/create_issue").unwrap();
        let (server, bare) = tool.split_qualified().unwrap();
        assert_eq!(server.as_str(), "github");
        assert_eq!(bare.as_str(), "create_issue");
    }

    #[test]
    fn test_split_double_underscore() {
        let tool = ToolName::new("fs__read_file").unwrap();
        let (server, bare) = tool.split_qualified().unwrap();
        assert_eq!(server.as_str(), "fs");
        assert_eq!(bare.as_str(), "read_file");
        assert!(ToolName::new("echo").unwrap().split_qualified().is_none());
    }

    #[test]
    fn test_serde_validates() {
        let ok: ServerName = serde_json::from_str("\"github\"").unwrap();
        assert_eq!(ok.as_str(), "github");
        assert!(serde_json::from_str::<ServerName>("\"bad name\"").is_err());
    }

    #[test]
    fn test_borrow_lookup() {
        let mut map = std::collections::HashMap::new();
        map.insert(ServerName::new("fs").unwrap(), 1);
        assert_eq!(map.get("fs"), Some(&1));
    }
}
