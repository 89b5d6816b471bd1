//! mcp-launch — local supervisor for mcpo-backed MCP stacks.
//! Inspects each configured MCP server over stdio JSON-RPC, lets the operator
//! curate what gets exposed, launches one stack per config (gateway + front
//! proxy + optional Cloudflare tunnel), and serves a single merged OpenAPI
//! document per stack at `/openapi.json`.

pub mod config;
pub mod error;
pub mod inspect;
pub mod instance;
pub mod merge;
pub mod overlay;
pub mod ports;
pub mod preflight;
pub mod proxy;
pub mod report;
pub mod runner;
pub mod stack;
pub mod tunnel;
pub mod ui;

pub use config::{
    DEFAULT_CONFIG, ServerDefinition, StackConfig, instance_name_from_path,
    sanitize_instance_name, write_instance_clone,
};
pub use error::{LaunchError, Result};
pub use inspect::{InspectorOptions, ToolDescriptor, inspect_server, inspect_server_with};
pub use instance::{
    API_KEY_LEN, Instance, InstanceDiagnostics, LaunchState, STATE_DIR, STATE_FILE,
    random_api_key,
};
pub use merge::{MergeOutcome, merge_documents, merge_instance};
pub use overlay::{
    CompositeOverlay, NestedOverlay, ServerSelection, composite_key, load_overlay, save_overlay,
    split_composite_key,
};
pub use ports::reserve_port;
pub use preflight::{
    PreflightOptions, PreflightPlan, ServerInventory, build_instances, inspect_all, run_review,
};
pub use proxy::{FrontProxyHandle, start_front_proxy};
pub use report::{operation_warning, render_report};
pub use runner::{LogSink, StreamOptions, find_in_path, kill_pid, kill_process_group};
pub use stack::{StackHandle, launch_stack, teardown_stack, wait_for_shutdown};
pub use tunnel::TunnelMode;
pub use ui::{AcceptSeed, OverlayEditor, ReviewSession, ServerStatus};
