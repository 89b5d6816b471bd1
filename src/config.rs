//! MCP stack configuration — deserialization, validation, and the filtered
//! per-instance clone handed to the gateway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LaunchError;
use crate::overlay::NestedOverlay;

/// Default config file name when no `--config` is given.
pub const DEFAULT_CONFIG: &str = "mcp.config.json";

/// One MCP server entry in a Claude-style config.
///
/// Either a command-line invocation (stdio transport) or a streamable-HTTP
/// endpoint. Immutable within a run. Absent fields stay absent on re-serialize
/// so cloned configs remain diff-friendly against their source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// `"streamable-http"` (or legacy `"sse"`) for HTTP transports.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ServerDefinition {
    /// True when this entry declares a streamable-HTTP endpoint.
    pub fn is_streamable_http(&self) -> bool {
        self.url.is_some()
            && self
                .transport
                .as_deref()
                .map(|t| t.trim().eq_ignore_ascii_case("streamable-http"))
                .unwrap_or(false)
    }
}

/// Top-level config: a single `mcpServers` map.
///
/// Backed by a `BTreeMap` so every iteration — including the merger's — is
/// lexicographic by server name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerDefinition>,
}

impl StackConfig {
    /// Read and parse a config file. An empty `mcpServers` map is a hard
    /// error: there is nothing to launch.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let shown = path.display().to_string();
        let data = std::fs::read(path)
            .map_err(|e| LaunchError::InvalidConfig(shown.clone(), e.to_string()))?;
        let config: StackConfig = serde_json::from_slice(&data)
            .map_err(|e| LaunchError::InvalidConfig(shown.clone(), e.to_string()))?;
        if config.mcp_servers.is_empty() {
            return Err(LaunchError::EmptyConfig(shown));
        }
        Ok(config)
    }

    /// Server names in lexicographic order.
    pub fn server_names(&self) -> Vec<String> {
        self.mcp_servers.keys().cloned().collect()
    }
}

/// Sanitize a config file stem into an instance name: `[A-Za-z0-9_-]` only,
/// everything else becomes `_`. Empty stems become `stack`.
pub fn sanitize_instance_name(stem: &str) -> String {
    let name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "stack".to_string()
    } else {
        name
    }
}

/// Derive an instance name from a config path (sanitized file stem).
pub fn instance_name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_instance_name(&stem)
}

/// Write the gateway-readable clone of a config for one instance:
/// `<state_dir>/tmp/<instance>/mcp.config.json` with disabled servers
/// removed. Allow/deny and description overrides are NOT applied here — the
/// gateway advertises every configured server's tools regardless, so those
/// are enforced later by the merger.
pub fn write_instance_clone(
    state_dir: &Path,
    instance: &str,
    config: &StackConfig,
    overlay: &NestedOverlay,
) -> crate::Result<PathBuf> {
    let mut filtered = StackConfig::default();
    for (name, def) in &config.mcp_servers {
        if overlay.is_disabled(instance, name) {
            tracing::debug!(instance = %instance, server = %name, "dropping disabled server from clone");
            continue;
        }
        filtered.mcp_servers.insert(name.clone(), def.clone());
    }

    let dir = state_dir.join("tmp").join(instance);
    std::fs::create_dir_all(&dir)
        .map_err(|e| LaunchError::State(format!("create {}: {e}", dir.display())))?;
    let path = dir.join(DEFAULT_CONFIG);
    let data = serde_json::to_vec_pretty(&filtered)
        .map_err(|e| LaunchError::State(format!("encode clone: {e}")))?;
    std::fs::write(&path, data)
        .map_err(|e| LaunchError::State(format!("write {}: {e}", path.display())))?;
    Ok(path)
}
