//! Per-instance stack supervisor: gateway, front proxy, tunnel, merge, and
//! signal-driven teardown of entire process groups.
//!
//! Launch order per instance: gateway (new process group, stdio streamed) →
//! readiness probe → front proxy → tunnel → merge + install. An instance
//! that fails to come up is skipped; the rest of the run continues. A failed
//! merge leaves `/openapi.json` serving 503 while proxying still works.
//!
//! Cleanup order per instance, bounded by short graces: front proxy (2 s) →
//! tunnel PID (signal only) → gateway process group (the tree-kill is what
//! reaps the gateway's own MCP children).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::StackConfig;
use crate::instance::Instance;
use crate::merge;
use crate::overlay::NestedOverlay;
use crate::proxy::{self, FrontProxyHandle};
use crate::runner::{self, SpawnedChild, StreamOptions};
use crate::tunnel::{self, TunnelMode};

/// How long the gateway gets to answer its first readiness probe.
pub const READINESS_WINDOW: Duration = Duration::from_secs(60);
/// Poll cadence for the readiness probe.
const READINESS_POLL: Duration = Duration::from_millis(500);
/// Graceful shutdown budget for the front proxy.
pub const PROXY_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Gateway binary name.
pub const GATEWAY_BIN: &str = "mcpo";

/// One running stack.
pub struct StackHandle {
    pub name: String,
    pub gateway: SpawnedChild,
    pub front: FrontProxyHandle,
    pub tunnel_pid: Option<u32>,
    /// Keeps the tunnel's child handle alive for the run.
    tunnel_child: Option<SpawnedChild>,
}

/// Poll `url` every 500 ms until any HTTP response arrives (status ignored —
/// a 4xx still proves the socket is alive) or `window` elapses.
pub async fn wait_until_ready(url: &str, window: Duration) -> crate::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| crate::LaunchError::Readiness(format!("{url}: {e}")))?;
    let deadline = tokio::time::Instant::now() + window;
    let mut ticker = tokio::time::interval(READINESS_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if client.get(url).send().await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(crate::LaunchError::Readiness(url.to_string()));
        }
    }
}

/// Bring up one instance end to end. On success the merged spec is already
/// installed (or the proxy left at 503 after a logged merge failure) and all
/// child PIDs are recorded on the instance.
pub async fn launch_stack(
    instance: &mut Instance,
    config: &StackConfig,
    overlay: &NestedOverlay,
    cloned_config: &Path,
    opts: &StreamOptions,
    state_dir: &Path,
) -> crate::Result<StackHandle> {
    // 1. Gateway, in its own process group.
    let args = vec![
        "--port".to_string(),
        instance.gateway_port.to_string(),
        "--api-key".to_string(),
        instance.api_key.clone(),
        "--config".to_string(),
        cloned_config.display().to_string(),
        "--hot-reload".to_string(),
    ];
    let mut gateway = runner::spawn_group(GATEWAY_BIN, &args, &BTreeMap::new())?;
    instance.gateway_pid = Some(gateway.pid);
    let tag = format!("mcpo:{}", instance.name);
    if let Some(out) = gateway.child.stdout.take() {
        runner::stream_lines(out, tag.clone(), opts.clone(), None);
    }
    if let Some(err) = gateway.child.stderr.take() {
        runner::stream_lines(err, tag.clone(), opts.clone(), None);
    }
    tracing::info!(instance = %instance.name, pid = gateway.pid, "gateway started");

    // 2. Readiness. A timeout here usually means the reserved port lost its
    // race; the instance is skipped, the run continues.
    let docs_url = format!("http://127.0.0.1:{}/docs", instance.gateway_port);
    if let Err(e) = wait_until_ready(&docs_url, READINESS_WINDOW).await {
        tracing::error!(instance = %instance.name, error = %e, "gateway never became ready");
        let _ = runner::kill_process_group(gateway.pid).await;
        return Err(e);
    }

    // 3. Front proxy.
    let front = match proxy::start_front_proxy(instance.front_port, instance.gateway_port).await {
        Ok(front) => front,
        Err(e) => {
            let _ = runner::kill_process_group(gateway.pid).await;
            return Err(e);
        }
    };

    // 4. Tunnel.
    let mut tunnel_child = None;
    match instance.tunnel_mode {
        TunnelMode::Quick => match tunnel::start_quick_tunnel(instance.front_port, opts) {
            Ok(mut launch) => {
                instance.tunnel_pid = Some(launch.child.pid);
                if let Some(mut url_rx) = launch.url_rx.take() {
                    match tokio::time::timeout(tunnel::QUICK_URL_WINDOW, url_rx.recv()).await {
                        Ok(Some(url)) => {
                            tracing::info!(instance = %instance.name, url = %url, "quick tunnel up");
                            instance.public_url = Some(url);
                        }
                        _ => {
                            let err = crate::LaunchError::TunnelTimeout(
                                tunnel::QUICK_URL_WINDOW.as_secs(),
                            );
                            tracing::warn!(
                                instance = %instance.name,
                                error = %err,
                                "continuing with local URL only"
                            );
                        }
                    }
                }
                tunnel_child = Some(launch.child);
            }
            Err(e) => {
                tracing::warn!(instance = %instance.name, error = %e, "quick tunnel failed to start");
            }
        },
        TunnelMode::Named => {
            match tunnel::start_named_tunnel(instance.tunnel_name.as_deref(), opts) {
                Ok(Some(launch)) => {
                    if instance.public_url.is_none() {
                        tracing::warn!(
                            instance = %instance.name,
                            "named tunnel selected but no --public-url given; merged spec will carry the local URL"
                        );
                    }
                    instance.tunnel_pid = Some(launch.child.pid);
                    tunnel_child = Some(launch.child);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(instance = %instance.name, error = %e, "named tunnel failed to start");
                }
            }
        }
        TunnelMode::None => {}
    }

    // 5. Merge and install. The spec is in place before any URL is shown.
    let base_url = instance.base_url();
    match merge::merge_instance(instance, config, overlay, &base_url).await {
        Ok(outcome) => {
            front.install_spec(outcome.bytes.clone()).await;
            let artifact = state_dir.join(format!("openapi_{}.json", instance.name));
            if let Err(e) = std::fs::write(&artifact, &outcome.bytes) {
                tracing::warn!(path = %artifact.display(), error = %e, "could not write merged-spec artifact");
            }
            for dangling in &outcome.dangling_refs {
                tracing::warn!(instance = %instance.name, reference = %dangling, "dangling component ref in merged spec");
            }
            instance.diagnostics = outcome.diagnostics;
        }
        Err(e) => {
            tracing::error!(
                instance = %instance.name,
                error = %e,
                "merge failed; /openapi.json will serve 503"
            );
        }
    }
    instance.tool_names = config
        .mcp_servers
        .keys()
        .filter(|server| !overlay.is_disabled(&instance.name, server.as_str()))
        .cloned()
        .collect();

    Ok(StackHandle {
        name: instance.name.clone(),
        gateway,
        front,
        tunnel_pid: instance.tunnel_pid,
        tunnel_child,
    })
}

/// Block until SIGINT/SIGTERM arrives or any gateway exits. Either event
/// tears down the whole run.
pub async fn wait_for_shutdown(handles: &mut [StackHandle]) {
    if handles.is_empty() {
        return;
    }
    let names: Vec<String> = handles.iter().map(|h| h.name.clone()).collect();
    let exits = handles
        .iter_mut()
        .map(|h| Box::pin(h.gateway.child.wait()));
    let any_exit = futures_util::future::select_all(exits);

    tokio::select! {
        _ = interrupt() => {
            tracing::info!("interrupt received, shutting down");
        }
        (result, index, _) = any_exit => {
            tracing::warn!(
                instance = %names[index],
                status = ?result.ok(),
                "gateway exited; tearing down the run"
            );
        }
    }
}

async fn interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, watching SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Tear one stack down. Failures are logged and cleanup continues — a stuck
/// step must not leave the later ones unattempted.
pub async fn teardown_stack(handle: StackHandle) {
    let StackHandle {
        name,
        mut gateway,
        front,
        tunnel_pid,
        tunnel_child,
    } = handle;

    front.close(PROXY_CLOSE_GRACE).await;

    if let Some(pid) = tunnel_pid {
        if let Err(e) = runner::kill_pid(pid).await {
            tracing::warn!(instance = %name, error = %e, "tunnel kill failed");
        }
    }
    drop(tunnel_child);

    if let Err(e) = runner::kill_process_group(gateway.pid).await {
        tracing::warn!(instance = %name, error = %e, "gateway group kill failed");
    }
    // Reap the gateway so no zombie outlives the run.
    let _ = tokio::time::timeout(Duration::from_secs(2), gateway.child.wait()).await;
    tracing::info!(instance = %name, "stack stopped");
}
