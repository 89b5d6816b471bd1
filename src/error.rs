//! Error types for mcp-launch operations.

use thiserror::Error;

/// Main error type for mcp-launch operations.
///
/// Instance-scoped failures (config, readiness, merge fetch) skip that
/// instance only; inspector failures are recorded per server and shown in the
/// preflight review. Nothing here aborts the whole run except via the caller.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Config file missing, unreadable, or structurally invalid
    #[error("invalid config {0}: {1}")]
    InvalidConfig(String, String),

    /// Config parsed but its `mcpServers` map is empty
    #[error("no mcpServers in {0}")]
    EmptyConfig(String),

    /// A child process could not be started
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, String),

    /// The initialize response was not read in time (or the pipe broke)
    #[error("init read: {0}")]
    InitRead(String),

    /// The server answered initialize with a JSON-RPC error
    #[error("initialize failed: {0}")]
    InitializeFailed(String),

    /// tools/list returned a JSON-RPC error after exhausting parameter shapes
    #[error("tools/list failed: {0}")]
    ToolsListFailed(String),

    /// A tools/list page response was not read in time (or the pipe broke)
    #[error("tools/list read: {0}")]
    ToolsListRead(String),

    /// Streamable-HTTP inspection is a stub; only the stdio fallback exists
    #[error("streamable-http inspection not implemented for server '{0}' without a stdio command fallback")]
    HttpInspectUnsupported(String),

    /// Port probing exhausted its search range
    #[error("no bindable port found within {1} probes of {0}")]
    PortExhausted(u16, u16),

    /// The gateway answered a per-tool OpenAPI fetch with a non-200 status
    #[error("fetch {0}: {1}")]
    Fetch(String, String),

    /// A fetched per-tool OpenAPI document did not parse
    #[error("parse {0}: {1}")]
    Parse(String, String),

    /// The gateway never answered its readiness probe
    #[error("timeout waiting for {0}")]
    Readiness(String),

    /// The quick tunnel did not print a public URL in time
    #[error("tunnel URL not captured within {0}s")]
    TunnelTimeout(u64),

    /// The front proxy could not bind or serve
    #[error("front proxy: {0}")]
    Proxy(String),

    /// State or overlay persistence failed
    #[error("state: {0}")]
    State(String),

    /// A cleanup step failed; cleanup continues regardless
    #[error("shutdown: {0}")]
    Shutdown(String),
}

/// Result type alias for mcp-launch operations
pub type Result<T> = std::result::Result<T, LaunchError>;
