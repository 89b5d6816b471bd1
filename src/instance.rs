//! Instance records and the `.mcp-launch/state.json` store.
//!
//! An instance is the runtime binding of one config file: its reserved ports,
//! API key, tunnel settings, child PIDs, and accumulated diagnostics. Records
//! live for one `up` invocation and are persisted so `status`, `share`,
//! `openapi`, and `down` can operate from other shells.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::LaunchError;
use crate::tunnel::TunnelMode;

/// Per-project state directory name.
pub const STATE_DIR: &str = ".mcp-launch";
/// Instance-record file name under the state dir.
pub const STATE_FILE: &str = "state.json";
/// Length of generated API keys.
pub const API_KEY_LEN: usize = 40;

/// Counters and warnings accumulated while merging one instance's OpenAPI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDiagnostics {
    /// Total operation count across the merged document.
    #[serde(default)]
    pub operation_count: usize,
    /// Operation count per server, summing HTTP-method keys per path item.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_server_operations: BTreeMap<String, usize>,
    /// Per-server `METHOD /path (tool=T): description length N > 300` lines.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub long_descriptions: BTreeMap<String, Vec<String>>,
}

/// Runtime binding of one config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub config_path: PathBuf,
    pub front_port: u16,
    pub gateway_port: u16,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub tunnel_mode: TunnelMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub started_at_unix: u64,
    #[serde(default)]
    pub diagnostics: InstanceDiagnostics,
}

impl Instance {
    /// Loopback base URL of the front proxy.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.front_port)
    }

    /// The externally-visible origin: public URL when known, local otherwise.
    pub fn base_url(&self) -> String {
        self.public_url.clone().unwrap_or_else(|| self.local_url())
    }

    /// The URL an operator pastes into an Actions importer.
    pub fn openapi_url(&self) -> String {
        format!("{}/openapi.json", self.base_url())
    }
}

/// Generate a random alphanumeric API key.
pub fn random_api_key(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Seconds since the Unix epoch, for `started_at` stamps.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The persisted set of instance records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchState {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl LaunchState {
    /// Load `state.json`, or `None` when missing or malformed.
    pub fn load(state_dir: &Path) -> Option<Self> {
        let path = state_dir.join(STATE_FILE);
        let data = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed state file");
                None
            }
        }
    }

    /// Persist the records under the state dir.
    pub fn save(&self, state_dir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| LaunchError::State(format!("create {}: {e}", state_dir.display())))?;
        let path = state_dir.join(STATE_FILE);
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| LaunchError::State(format!("encode state: {e}")))?;
        std::fs::write(&path, data)
            .map_err(|e| LaunchError::State(format!("write {}: {e}", path.display())))
    }
}
