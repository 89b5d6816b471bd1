//! mcp-launch — one URL for many MCP servers (via mcpo).
//!
//! `up` runs the preflight (inspect + overlay review), then launches one
//! stack per config file: the mcpo gateway, a front proxy serving the merged
//! OpenAPI at `/openapi.json`, and optionally a Cloudflare tunnel. The other
//! commands operate on the state the last `up` left in `.mcp-launch/`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use mcp_launch::instance::unix_now;
use mcp_launch::{
    AcceptSeed, DEFAULT_CONFIG, InspectorOptions, Instance, LaunchState, LogSink, NestedOverlay,
    PreflightOptions, STATE_DIR, StackConfig, StreamOptions, TunnelMode, build_instances,
    find_in_path, inspect_all, kill_pid, kill_process_group, launch_stack, load_overlay,
    merge_instance, render_report, run_review, teardown_stack, wait_for_shutdown,
    write_instance_clone,
};
use tracing_subscriber::EnvFilter;

/// mcp-launch — supervisor for mcpo-backed MCP stacks.
#[derive(Parser)]
#[command(
    name = "mcp-launch",
    version,
    about = "One URL for many MCP servers (via mcpo). Serves /openapi.json and proxies everything else to mcpo."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold mcp.config.json and default state
    Init,
    /// Check dependencies (mcpo, cloudflared, plus commands referenced by configs)
    Doctor,
    /// Start stacks: mcpo + front proxy (+ optional tunnel), then merge OpenAPI
    Up(UpArgs),
    /// Show ports, URLs, detected tools, API keys
    Status,
    /// Print the URL(s) to paste into an Actions importer
    Share,
    /// Regenerate the merged OpenAPI from the running gateways
    Openapi {
        /// Public base URL override for merged servers[0].url
        #[arg(long = "public-url")]
        public_url: Option<String>,
    },
    /// Stop recorded gateways and tunnels
    Down,
    /// Print the version
    Version,
}

#[derive(Args)]
struct UpArgs {
    /// Config file; repeat for one stack per config [default: mcp.config.json]
    #[arg(long = "config")]
    configs: Vec<PathBuf>,
    /// Base front-proxy port; instance i reserves >= port+i
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Base gateway port; analogous reservation
    #[arg(long = "mcpo-port", default_value_t = 8800)]
    mcpo_port: u16,
    /// Explicit API key (one key for the whole run)
    #[arg(long = "api-key")]
    api_key: Option<String>,
    /// One shared API key across all instances instead of per-instance keys
    #[arg(long = "shared-key")]
    shared_key: bool,
    /// Tunnel mode: quick | named | none
    #[arg(long, default_value = "quick")]
    tunnel: TunnelMode,
    /// Public base URL per instance (repeatable, positional)
    #[arg(long = "public-url")]
    public_urls: Vec<String>,
    /// Named tunnel to run (cloudflared tunnel run NAME)
    #[arg(long = "tunnel-name")]
    tunnel_name: Option<String>,
    /// Run the interactive preflight review before launch
    #[arg(long)]
    tui: bool,
    /// Verbose (-v) / debug (-vv) streaming of child stdio
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
    /// Stream child stdio regardless of verbosity
    #[arg(long)]
    stream: bool,
    /// Tee all tagged child output lines to a file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbosity = match &cli.command {
        Commands::Up(args) => args.verbose,
        _ => 0,
    };
    init_tracing(verbosity);

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Doctor => cmd_doctor(),
        Commands::Up(args) => cmd_up(args).await,
        Commands::Status => cmd_status(),
        Commands::Share => cmd_share(),
        Commands::Openapi { public_url } => cmd_openapi(public_url).await,
        Commands::Down => cmd_down().await,
        Commands::Version => {
            println!("mcp-launch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(verbosity: u8) {
    use std::io::IsTerminal;

    let default_filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let ansi = std::io::stderr().is_terminal()
        && std::env::var_os("NO_COLOR").is_none()
        && std::env::var_os("TERM").map(|t| t != "dumb").unwrap_or(true);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

fn state_dir() -> PathBuf {
    PathBuf::from(STATE_DIR)
}

fn ensure_state_dir() -> Result<PathBuf> {
    let dir = state_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create state dir {}", dir.display()))?;
    Ok(dir)
}

fn cmd_init() -> Result<()> {
    let config_path = PathBuf::from(DEFAULT_CONFIG);
    if config_path.exists() {
        println!("{DEFAULT_CONFIG} already exists; not overwriting");
    } else {
        let starter = r#"{
  "mcpServers": {
    "serena": {
      "command": "uvx",
      "args": ["--from", "git+https://github.com/oraios/serena", "serena", "start-mcp-server", "--context", "ide-assistant"]
    },
    "time": {
      "command": "uvx",
      "args": ["mcp-server-time", "--local-timezone=America/Phoenix"]
    },
    "filesystem": {
      "command": "npx",
      "args": ["-y", "@modelcontextprotocol/server-filesystem", "/workspaces/projects"]
    }
  }
}
"#;
        std::fs::write(&config_path, starter)
            .with_context(|| format!("write {DEFAULT_CONFIG}"))?;
        println!("Wrote {DEFAULT_CONFIG}");
    }

    let dir = ensure_state_dir()?;
    if LaunchState::load(&dir).is_none() {
        LaunchState::default()
            .save(&dir)
            .context("write default state")?;
    }
    println!("Initialized {}/state.json", dir.display());
    Ok(())
}

fn cmd_doctor() -> Result<()> {
    let config_paths: Vec<PathBuf> = LaunchState::load(&state_dir())
        .map(|state| {
            state
                .instances
                .iter()
                .map(|i| i.config_path.clone())
                .collect::<Vec<_>>()
        })
        .filter(|paths| !paths.is_empty())
        .unwrap_or_else(|| vec![PathBuf::from(DEFAULT_CONFIG)]);

    let mut checks: Vec<String> = vec!["mcpo".to_string(), "cloudflared".to_string()];
    let mut referenced = BTreeSet::new();
    for path in &config_paths {
        match StackConfig::load(path) {
            Ok(config) => {
                for def in config.mcp_servers.values() {
                    if let Some(command) = &def.command {
                        referenced.insert(command.clone());
                    }
                }
            }
            Err(e) => eprintln!("warning: {e}"),
        }
    }
    checks.extend(referenced);

    println!("Dependency checks:");
    let mut all_found = true;
    for binary in checks {
        match find_in_path(&binary) {
            Some(_) => println!("  ✓ {binary} found"),
            None => {
                println!("  ✗ {binary} not found in PATH");
                all_found = false;
            }
        }
    }
    if all_found {
        println!("All required executables found.");
    } else {
        println!("Missing executables detected. Install the items marked ✗ and retry.");
    }
    Ok(())
}

async fn cmd_up(args: UpArgs) -> Result<()> {
    let dir = ensure_state_dir()?;

    let config_paths = if args.configs.is_empty() {
        vec![PathBuf::from(DEFAULT_CONFIG)]
    } else {
        args.configs.clone()
    };

    let opts = PreflightOptions {
        config_paths,
        base_front_port: args.port,
        base_gateway_port: args.mcpo_port,
        api_key: args.api_key.clone(),
        shared_key: args.shared_key,
        tunnel_mode: args.tunnel,
        tunnel_name: args.tunnel_name.clone(),
        public_urls: args.public_urls.clone(),
    };
    let mut plan = build_instances(&opts).map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!(
        instances = plan.instances.len(),
        "inspecting configured servers"
    );
    let inventory = inspect_all(&plan, &InspectorOptions::default()).await;

    if args.tui {
        // The interactive widgets attach through the OverlayEditor seam;
        // without a frontend the seeded overlay is accepted as-is.
        tracing::info!("no interactive review frontend attached; accepting persisted overlay");
    }
    let mut editor = AcceptSeed;
    let overlay = match run_review(&plan, &inventory, &dir, &mut editor)
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        Some(overlay) => overlay,
        None => {
            println!("cancelled");
            return Ok(());
        }
    };

    let log = match &args.log_file {
        Some(path) => Some(
            LogSink::open(path).with_context(|| format!("open log file {}", path.display()))?,
        ),
        None => None,
    };
    let stream_opts = StreamOptions {
        echo: args.verbose > 0 || args.stream,
        log,
    };

    let mut handles = Vec::new();
    for instance in plan.instances.iter_mut() {
        let Some(config) = plan.configs.get(&instance.name) else {
            continue;
        };
        let cloned = match write_instance_clone(&dir, &instance.name, config, &overlay) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(instance = %instance.name, error = %e, "could not write config clone");
                continue;
            }
        };
        instance.started_at_unix = unix_now();
        match launch_stack(instance, config, &overlay, &cloned, &stream_opts, &dir).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::error!(instance = %instance.name, error = %e, "stack failed to start; skipping");
            }
        }
    }
    if handles.is_empty() {
        bail!("no stack started");
    }

    LaunchState {
        instances: plan.instances.clone(),
    }
    .save(&dir)
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let started: BTreeSet<String> = handles.iter().map(|h| h.name.clone()).collect();
    let report_instances: Vec<Instance> = plan
        .instances
        .iter()
        .filter(|i| started.contains(&i.name))
        .cloned()
        .collect();
    println!();
    println!("=== SHARE THIS WITH YOUR MODEL (Actions → Import from URL) ===");
    print!("{}", render_report(&report_instances, args.verbose > 0));
    println!("Press Ctrl+C to stop (or run `mcp-launch down` from another shell).");

    wait_for_shutdown(&mut handles).await;
    for handle in handles {
        teardown_stack(handle).await;
    }

    let mut final_state = LaunchState {
        instances: plan.instances,
    };
    for instance in final_state.instances.iter_mut() {
        instance.gateway_pid = None;
        instance.tunnel_pid = None;
    }
    final_state.save(&dir).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("clean shutdown complete");
    Ok(())
}

fn cmd_status() -> Result<()> {
    let Some(state) = LaunchState::load(&state_dir()) else {
        println!("No state found. Run `mcp-launch up` first.");
        return Ok(());
    };
    println!("mcp-launch status:");
    for instance in &state.instances {
        println!("- stack {}:", instance.name);
        println!(
            "    Front: {}  (serves /openapi.json; proxies to mcpo)",
            instance.local_url()
        );
        println!("    mcpo:  http://127.0.0.1:{}", instance.gateway_port);
        match &instance.public_url {
            Some(url) => println!("    Public URL: {url}"),
            None => println!("    Public URL: (none)"),
        }
        println!("    Tunnel: {}", instance.tunnel_mode);
        println!("    Servers: {}", instance.tool_names.join(", "));
        println!("    API key (X-API-Key): {}", instance.api_key);
    }
    Ok(())
}

fn cmd_share() -> Result<()> {
    let Some(state) = LaunchState::load(&state_dir()) else {
        println!("No state found. Run `mcp-launch up` first.");
        return Ok(());
    };
    for instance in &state.instances {
        if instance.public_url.is_none() {
            println!(
                "{}  (local only; no public URL known for {})",
                instance.openapi_url(),
                instance.name
            );
        } else {
            println!("{}", instance.openapi_url());
        }
    }
    Ok(())
}

async fn cmd_openapi(public_url: Option<String>) -> Result<()> {
    let dir = state_dir();
    let Some(state) = LaunchState::load(&dir) else {
        bail!("no state found; run `mcp-launch up` first");
    };
    let composite = load_overlay(&dir).unwrap_or_default();
    let known: Vec<String> = state.instances.iter().map(|i| i.name.clone()).collect();
    let overlay = NestedOverlay::from_composite(&composite, &known);

    for instance in &state.instances {
        let config = match StackConfig::load(&instance.config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("skipping {}: {e}", instance.name);
                continue;
            }
        };
        let base = public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| instance.base_url());
        match merge_instance(instance, &config, &overlay, &base).await {
            Ok(outcome) => {
                let path = dir.join(format!("openapi_{}.json", instance.name));
                std::fs::write(&path, &outcome.bytes)
                    .with_context(|| format!("write {}", path.display()))?;
                println!("Wrote merged OpenAPI to {}", path.display());
                println!(
                    "Serve URL (if front proxy running): http://127.0.0.1:{}/openapi.json",
                    instance.front_port
                );
            }
            Err(e) => eprintln!("OpenAPI merge failed for {}: {e}", instance.name),
        }
    }
    Ok(())
}

async fn cmd_down() -> Result<()> {
    let dir = state_dir();
    let Some(mut state) = LaunchState::load(&dir) else {
        println!("No state found; nothing to stop.");
        return Ok(());
    };
    for instance in state.instances.iter_mut() {
        if let Some(pid) = instance.tunnel_pid.take() {
            match kill_pid(pid).await {
                Ok(()) => println!("Stopped cloudflared (pid {pid})"),
                Err(e) => eprintln!("cloudflared pid {pid}: {e}"),
            }
        }
        if let Some(pid) = instance.gateway_pid.take() {
            match kill_process_group(pid).await {
                Ok(()) => println!("Stopped mcpo (pid {pid})"),
                Err(e) => eprintln!("mcpo pid {pid}: {e}"),
            }
        }
    }
    state.save(&dir).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
