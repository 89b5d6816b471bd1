//! MCP stdio inspector: a JSON-RPC client that discovers a server's tools.
//!
//! Framing is strictly newline-delimited JSON in both directions. Mixing LSP
//! `Content-Length` framing on the same connection is deliberately not
//! attempted — auto-detection caused stalls. Non-JSON stdout lines (startup
//! banners, dashboard URLs) are skipped; stderr is drained and discarded so a
//! chatty server cannot block on a full pipe.
//!
//! The handshake tolerates wide server variance: a fast init window with one
//! slow retry for cold package-runner caches, responses declaring older
//! protocol dates, and four first-page parameter shapes for `tools/list`.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::time::Instant;

use crate::config::ServerDefinition;
use crate::error::LaunchError;

/// Protocol date we advertise on initialize. Servers answering with older
/// dates (e.g. `2024-11-05`) are accepted as successful.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
/// Client name reported in `clientInfo`.
pub const CLIENT_NAME: &str = "mcp-launch";
/// Environment variable overriding the slow init window, in seconds.
pub const INIT_TIMEOUT_ENV: &str = "MCP_INIT_TIMEOUT_SEC";

const INIT_FAST_WINDOW: Duration = Duration::from_secs(6);
const DEFAULT_INIT_SLOW_SECS: u64 = 20;
const PAGE_WINDOW: Duration = Duration::from_secs(12);

/// A tool discovered via `tools/list`. The description is the primary
/// mutable surface for operator overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Inspector timeouts. Injectable so tests can shrink the windows.
#[derive(Debug, Clone)]
pub struct InspectorOptions {
    /// First wait for the initialize response.
    pub init_fast: Duration,
    /// Retry window after a fast-path deadline (cold caches, slow installs).
    pub init_slow: Duration,
    /// Per-page wait for a `tools/list` response.
    pub page_window: Duration,
}

impl Default for InspectorOptions {
    fn default() -> Self {
        let slow_secs = std::env::var(INIT_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_INIT_SLOW_SECS);
        Self {
            init_fast: INIT_FAST_WINDOW,
            init_slow: Duration::from_secs(slow_secs),
            page_window: PAGE_WINDOW,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    #[allow(dead_code)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize, Default)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// Why a read gave up. Only `Deadline` triggers the slow-window retry.
#[derive(Debug)]
enum ReadError {
    Deadline,
    Closed,
    Io(String),
}

impl ReadError {
    fn describe(&self) -> String {
        match self {
            ReadError::Deadline => "deadline exceeded".to_string(),
            ReadError::Closed => "unexpected EOF".to_string(),
            ReadError::Io(e) => e.clone(),
        }
    }
}

/// Discover the tools of one configured server with default timeouts.
pub async fn inspect_server(
    name: &str,
    def: &ServerDefinition,
) -> crate::Result<Vec<ToolDescriptor>> {
    inspect_server_with(name, def, &InspectorOptions::default()).await
}

/// Discover the tools of one configured server.
///
/// Streamable-HTTP definitions fall back to stdio inspection when a command
/// is also present; without one there is nothing to inspect yet.
pub async fn inspect_server_with(
    name: &str,
    def: &ServerDefinition,
    opts: &InspectorOptions,
) -> crate::Result<Vec<ToolDescriptor>> {
    if def.is_streamable_http() && def.command.is_none() {
        return Err(LaunchError::HttpInspectUnsupported(name.to_string()));
    }
    inspect_stdio(name, def, opts).await
}

async fn inspect_stdio(
    name: &str,
    def: &ServerDefinition,
    opts: &InspectorOptions,
) -> crate::Result<Vec<ToolDescriptor>> {
    let command = def.command.as_deref().ok_or_else(|| {
        LaunchError::InvalidConfig(name.to_string(), "server has no command".to_string())
    })?;

    let mut cmd = Command::new(command);
    cmd.args(&def.args);
    for (k, v) in &def.env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::Spawn(command.to_string(), e.to_string()))?;

    let stdin = child.stdin.take().ok_or_else(|| {
        LaunchError::Spawn(command.to_string(), "failed to open stdin pipe".to_string())
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        LaunchError::Spawn(command.to_string(), "failed to open stdout pipe".to_string())
    })?;
    if let Some(stderr) = child.stderr.take() {
        drain_stderr(stderr);
    }

    let result = run_session(name, stdin, stdout, opts).await;
    // The child is killed whether the session succeeded or not; readers it
    // may have leaked exit once the pipes close.
    let _ = child.kill().await;
    result
}

/// Drain stderr to discard in a dedicated task — never parsed, never logged
/// line-by-line. Some servers log heavily and would otherwise block.
fn drain_stderr(stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
}

async fn run_session(
    name: &str,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    opts: &InspectorOptions,
) -> crate::Result<Vec<ToolDescriptor>> {
    let mut lines = BufReader::new(stdout).lines();

    // 1) initialize, id = 1.
    let init = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
        },
    });
    send_line(&mut stdin, &init).await?;

    // Fast window first; retry once with the slow window only on a deadline.
    let response = match wait_for_response(&mut lines, 1, opts.init_fast).await {
        Ok(r) => r,
        Err(ReadError::Deadline) => {
            tracing::debug!(server = %name, "init fast window elapsed, retrying with slow window");
            wait_for_response(&mut lines, 1, opts.init_slow)
                .await
                .map_err(|e| LaunchError::InitRead(e.describe()))?
        }
        Err(e) => return Err(LaunchError::InitRead(e.describe())),
    };
    if let Some(err) = response.error {
        return Err(LaunchError::InitializeFailed(err.message));
    }
    if let Some(version) = response
        .result
        .as_ref()
        .and_then(|r| r.get("protocolVersion"))
        .and_then(Value::as_str)
    {
        // Older protocol dates are fine; record what the server actually speaks.
        tracing::debug!(server = %name, protocol = %version, "initialize ok");
    }

    // 2) one-way initialized notification.
    let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    send_line(&mut stdin, &initialized).await?;

    // 3) paginated tools/list, ids from 3. Every request gets a fresh id so a
    // late answer to an abandoned shape can never match the current wait.
    let mut tools: Vec<ToolDescriptor> = Vec::new();
    let mut next_id: i64 = 3;
    let mut cursor: Option<String> = None;

    loop {
        let shapes: Vec<Option<Value>> = match &cursor {
            // Subsequent pages use the cursor shape only.
            Some(c) => vec![Some(json!({"cursor": c}))],
            // First page: try shapes until one does not elicit an error.
            None => vec![
                Some(json!({})),
                Some(json!({"cursor": ""})),
                Some(json!({"cursor": null})),
                None,
            ],
        };

        let mut page: Option<ToolsPage> = None;
        let last_shape = shapes.len() - 1;
        for (attempt, params) in shapes.into_iter().enumerate() {
            let id = next_id;
            next_id += 1;

            let mut request = json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"});
            if let Some(p) = params {
                request["params"] = p;
            }
            send_line(&mut stdin, &request).await?;

            let response = wait_for_response(&mut lines, id, opts.page_window)
                .await
                .map_err(|e| LaunchError::ToolsListRead(e.describe()))?;

            if let Some(err) = response.error {
                if attempt < last_shape {
                    tracing::debug!(
                        server = %name,
                        attempt = attempt + 1,
                        error = %err.message,
                        "tools/list shape rejected, trying next"
                    );
                    continue;
                }
                return Err(LaunchError::ToolsListFailed(err.message));
            }

            let parsed: ToolsPage = response
                .result
                .map(|r| serde_json::from_value(r).unwrap_or_default())
                .unwrap_or_default();
            page = Some(parsed);
            break;
        }

        // All error shapes return above, so a page is always present here.
        let page = page.unwrap_or_default();
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.trim().is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }
}

async fn send_line(stdin: &mut ChildStdin, message: &Value) -> crate::Result<()> {
    let mut buf = serde_json::to_vec(message)
        .map_err(|e| LaunchError::InitRead(format!("encode request: {e}")))?;
    buf.push(b'\n');
    stdin
        .write_all(&buf)
        .await
        .map_err(|e| LaunchError::InitRead(format!("write request: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| LaunchError::InitRead(format!("flush request: {e}")))
}

/// Read JSON lines until one carries a response whose id matches `want`,
/// then return it. The early return is the only exit on a match — scanning
/// never falls through to the next page's wait.
async fn wait_for_response<R>(
    lines: &mut Lines<BufReader<R>>,
    want: i64,
    window: Duration,
) -> Result<RpcResponse, ReadError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let deadline = Instant::now() + window;
    loop {
        let value = next_json(lines, deadline).await?;
        if let Ok(response) = serde_json::from_value::<RpcResponse>(value) {
            if id_matches(response.id.as_ref(), want) {
                return Ok(response);
            }
        }
    }
}

/// Read the next parseable JSON line before `deadline`, skipping blanks and
/// non-JSON noise (banners, progress lines).
async fn next_json<R>(
    lines: &mut Lines<BufReader<R>>,
    deadline: Instant,
) -> Result<Value, ReadError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        if Instant::now() >= deadline {
            return Err(ReadError::Deadline);
        }
        match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => return Err(ReadError::Deadline),
            Ok(Err(e)) => return Err(ReadError::Io(e.to_string())),
            Ok(Ok(None)) => return Err(ReadError::Closed),
            Ok(Ok(Some(line))) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => return Ok(value),
                    Err(_) => continue,
                }
            }
        }
    }
}

/// Integer and numeric-float ids both match (`1` and `1.0` alike).
fn id_matches(id: Option<&Value>, want: i64) -> bool {
    match id {
        Some(Value::Number(n)) => {
            n.as_i64() == Some(want)
                || n.as_f64().map(|f| f == want as f64).unwrap_or(false)
        }
        _ => false,
    }
}
