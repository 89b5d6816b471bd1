//! Preflight driver: build instances, inspect every configured server, seed
//! the review session, and translate the accepted overlay for launch.
//!
//! Inspection failures never abort the preflight — the server is recorded
//! with status `ERR` and its error text, and stays visible to the review.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{StackConfig, instance_name_from_path};
use crate::error::LaunchError;
use crate::inspect::{InspectorOptions, ToolDescriptor, inspect_server_with};
use crate::instance::{API_KEY_LEN, Instance, random_api_key, unix_now};
use crate::overlay::{self, NestedOverlay, composite_key};
use crate::ports;
use crate::tunnel::TunnelMode;
use crate::ui::{OverlayEditor, ReviewSession, ServerStatus};

/// Outer deadline for inspecting one `(instance, server)` pair.
pub const INSPECT_DEADLINE: Duration = Duration::from_secs(15);

/// Inputs assembled from the `up` invocation.
#[derive(Debug, Clone)]
pub struct PreflightOptions {
    pub config_paths: Vec<PathBuf>,
    pub base_front_port: u16,
    pub base_gateway_port: u16,
    pub api_key: Option<String>,
    pub shared_key: bool,
    pub tunnel_mode: TunnelMode,
    pub tunnel_name: Option<String>,
    pub public_urls: Vec<String>,
}

/// Instances plus their loaded configs, keyed by instance name.
pub struct PreflightPlan {
    pub instances: Vec<Instance>,
    pub configs: BTreeMap<String, StackConfig>,
}

/// Inspection record for one `(instance, server)` pair.
#[derive(Debug, Clone)]
pub struct ServerInventory {
    pub tools: Vec<ToolDescriptor>,
    pub status: ServerStatus,
    pub error: Option<String>,
}

/// Build the instance list: load configs, derive unique names, reserve
/// distinct ports, assign API keys. Unloadable configs are skipped with an
/// error log; a run with no usable config is an error.
pub fn build_instances(opts: &PreflightOptions) -> crate::Result<PreflightPlan> {
    let shared_key = if opts.shared_key || opts.api_key.is_some() {
        // An explicit key is inherently one key for the whole run.
        Some(
            opts.api_key
                .clone()
                .unwrap_or_else(|| random_api_key(API_KEY_LEN)),
        )
    } else {
        None
    };

    let mut taken: BTreeSet<u16> = BTreeSet::new();
    let mut used_names: BTreeSet<String> = BTreeSet::new();
    let mut instances = Vec::new();
    let mut configs = BTreeMap::new();

    for (index, path) in opts.config_paths.iter().enumerate() {
        let config = match StackConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(config = %path.display(), error = %e, "skipping unusable config");
                continue;
            }
        };

        let mut name = instance_name_from_path(path);
        if used_names.contains(&name) {
            let mut suffix = 2;
            loop {
                let candidate = format!("{name}_{suffix}");
                if !used_names.contains(&candidate) {
                    name = candidate;
                    break;
                }
                suffix += 1;
            }
        }
        used_names.insert(name.clone());

        let offset = index as u16;
        let front_port = reserve_or_base(opts.base_front_port.saturating_add(offset), &mut taken);
        let gateway_port =
            reserve_or_base(opts.base_gateway_port.saturating_add(offset), &mut taken);

        let api_key = shared_key
            .clone()
            .unwrap_or_else(|| random_api_key(API_KEY_LEN));
        let public_url = opts
            .public_urls
            .get(index)
            .map(|u| u.trim_end_matches('/').to_string());

        instances.push(Instance {
            name: name.clone(),
            config_path: path.clone(),
            front_port,
            gateway_port,
            api_key,
            public_url,
            tunnel_mode: opts.tunnel_mode,
            tunnel_name: opts.tunnel_name.clone(),
            gateway_pid: None,
            tunnel_pid: None,
            tool_names: config.server_names(),
            started_at_unix: unix_now(),
            diagnostics: Default::default(),
        });
        configs.insert(name, config);
    }

    if instances.is_empty() {
        return Err(LaunchError::InvalidConfig(
            "preflight".to_string(),
            "no usable configs".to_string(),
        ));
    }
    Ok(PreflightPlan { instances, configs })
}

/// Reserve a port near `base`, falling back to `base` itself rather than
/// wedging the run when probing is exhausted.
fn reserve_or_base(base: u16, taken: &mut BTreeSet<u16>) -> u16 {
    let port = match ports::reserve_port(base, taken) {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!(base = %base, error = %e, "port probing exhausted, using base");
            base
        }
    };
    taken.insert(port);
    port
}

/// Inspect every `(instance, server)` pair under the outer deadline. All
/// servers end up in the inventory, errored ones with their error text.
pub async fn inspect_all(
    plan: &PreflightPlan,
    opts: &InspectorOptions,
) -> BTreeMap<String, ServerInventory> {
    let mut inventory = BTreeMap::new();
    for instance in &plan.instances {
        let Some(config) = plan.configs.get(&instance.name) else {
            continue;
        };
        for (server, def) in &config.mcp_servers {
            let key = composite_key(&instance.name, server);
            let entry = match tokio::time::timeout(
                INSPECT_DEADLINE,
                inspect_server_with(server, def, opts),
            )
            .await
            {
                Ok(Ok(tools)) => {
                    tracing::info!(server = %key, tool_count = tools.len(), "inspection ok");
                    ServerInventory {
                        tools,
                        status: ServerStatus::Ok,
                        error: None,
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %key, error = %e, "inspection failed");
                    ServerInventory {
                        tools: Vec::new(),
                        status: ServerStatus::Err,
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    let e = LaunchError::InitRead("deadline exceeded".to_string());
                    tracing::warn!(server = %key, error = %e, "inspection deadline");
                    ServerInventory {
                        tools: Vec::new(),
                        status: ServerStatus::Err,
                        error: Some(e.to_string()),
                    }
                }
            };
            inventory.insert(key, entry);
        }
    }
    inventory
}

/// Seed the review session from the inventory and the persisted overlay,
/// hand it to the editor, and on acceptance persist the result and return it
/// in nested form. `Ok(None)` means the operator cancelled.
pub fn run_review(
    plan: &PreflightPlan,
    inventory: &BTreeMap<String, ServerInventory>,
    state_dir: &Path,
    editor: &mut dyn OverlayEditor,
) -> crate::Result<Option<NestedOverlay>> {
    let seed = overlay::load_overlay(state_dir);

    let tools = inventory
        .iter()
        .map(|(key, inv)| (key.clone(), inv.tools.clone()))
        .collect();
    let status = inventory
        .iter()
        .map(|(key, inv)| (key.clone(), inv.status))
        .collect();
    let errors = inventory
        .iter()
        .filter_map(|(key, inv)| inv.error.clone().map(|e| (key.clone(), e)))
        .collect();

    let session = ReviewSession::new(tools, status, errors, seed);
    let Some((composite, launch_mode)) = editor.review(session) else {
        return Ok(None);
    };
    tracing::debug!(mode = %launch_mode, "review accepted");
    overlay::save_overlay(state_dir, &composite)?;

    let known: Vec<String> = plan.instances.iter().map(|i| i.name.clone()).collect();
    Ok(Some(NestedOverlay::from_composite(&composite, &known)))
}
