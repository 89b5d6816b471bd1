//! Tunnel controller: starts `cloudflared` and, for quick tunnels, captures
//! the ephemeral public URL from its log output.
//!
//! Quick mode scans both stdout and stderr for a line mentioning
//! `trycloudflare.com` and extracts the first `http…` token. Named mode runs
//! an operator-owned tunnel and parses nothing — the public URL must be
//! supplied explicitly. Only one named tunnel is started per run; later
//! requests are no-ops (first-start wins).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::runner::{self, SpawnedChild, StreamOptions};

/// How long the supervisor waits for a quick-tunnel URL.
pub const QUICK_URL_WINDOW: Duration = Duration::from_secs(25);

/// The substring that marks a quick-tunnel announcement line.
const QUICK_HOST_MARKER: &str = "trycloudflare.com";

static NAMED_TUNNEL_STARTED: AtomicBool = AtomicBool::new(false);

/// Tunnel operating mode for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[default]
    Quick,
    Named,
    None,
}

impl FromStr for TunnelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(TunnelMode::Quick),
            "named" => Ok(TunnelMode::Named),
            "none" => Ok(TunnelMode::None),
            other => Err(format!("unknown tunnel mode '{other}' (quick|named|none)")),
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelMode::Quick => "quick",
            TunnelMode::Named => "named",
            TunnelMode::None => "none",
        };
        f.write_str(s)
    }
}

/// A started tunnel process. `url_rx` is populated for quick tunnels only.
pub struct TunnelLaunch {
    pub child: SpawnedChild,
    pub url_rx: Option<mpsc::Receiver<String>>,
}

/// Extract the first `http…` token from a log line: starts at `http`, ends
/// before whitespace, trailing bracket/quote punctuation trimmed.
pub fn extract_public_url(line: &str) -> Option<String> {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    let re = URL_RE.get_or_init(|| Regex::new(r"http\S+").expect("static url regex"));
    let token = re.find(line)?.as_str();
    let trimmed = token.trim_end_matches(['[', ']', '(', ')', '{', '}', '<', '>', '"', '\'']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.trim_end_matches('/').to_string())
    }
}

/// Start a quick tunnel pointed at the front proxy. The returned receiver
/// fires at most once with the public URL.
pub fn start_quick_tunnel(front_port: u16, opts: &StreamOptions) -> crate::Result<TunnelLaunch> {
    let args = vec![
        "tunnel".to_string(),
        "--url".to_string(),
        format!("http://127.0.0.1:{front_port}"),
    ];
    let mut spawned = runner::spawn_group("cloudflared", &args, &BTreeMap::new())?;

    let (tx, rx) = mpsc::channel::<String>(1);
    let url_hook = |tx: mpsc::Sender<String>| -> runner::LineHook {
        Box::new(move |line: &str| {
            if line.contains(QUICK_HOST_MARKER) {
                if let Some(url) = extract_public_url(line) {
                    // Single-slot channel: first URL wins, later sends drop.
                    let _ = tx.try_send(url);
                }
            }
        })
    };
    if let Some(out) = spawned.child.stdout.take() {
        runner::stream_lines(
            out,
            "cloudflared".to_string(),
            opts.clone(),
            Some(url_hook(tx.clone())),
        );
    }
    if let Some(err) = spawned.child.stderr.take() {
        runner::stream_lines(
            err,
            "cloudflared".to_string(),
            opts.clone(),
            Some(url_hook(tx)),
        );
    }

    Ok(TunnelLaunch {
        child: spawned,
        url_rx: Some(rx),
    })
}

/// Start a named tunnel (`cloudflared tunnel run [name]`). Returns `None`
/// when a named tunnel was already started in this run.
pub fn start_named_tunnel(
    name: Option<&str>,
    opts: &StreamOptions,
) -> crate::Result<Option<TunnelLaunch>> {
    if NAMED_TUNNEL_STARTED.swap(true, Ordering::SeqCst) {
        tracing::info!("named tunnel already running for this process; skipping");
        return Ok(None);
    }
    let mut args = vec!["tunnel".to_string(), "run".to_string()];
    if let Some(n) = name {
        if !n.is_empty() {
            args.push(n.to_string());
        }
    }
    let mut spawned = runner::spawn_group("cloudflared", &args, &BTreeMap::new())?;
    if let Some(out) = spawned.child.stdout.take() {
        runner::stream_lines(out, "cloudflared".to_string(), opts.clone(), None);
    }
    if let Some(err) = spawned.child.stderr.take() {
        runner::stream_lines(err, "cloudflared".to_string(), opts.clone(), None);
    }
    Ok(Some(TunnelLaunch {
        child: spawned,
        url_rx: None,
    }))
}
