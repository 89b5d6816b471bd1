//! Review-session state back-end for the preflight UI.
//!
//! The visual widgets are an external collaborator; this module owns the
//! state they read (server keys, discovered tools, statuses, error texts,
//! the overlay under edit) and the mutations they perform. Errored servers
//! stay listed with their error text — hiding them was a reported usability
//! failure and is prohibited.

use std::collections::{BTreeMap, BTreeSet};

use crate::inspect::ToolDescriptor;
use crate::overlay::{CompositeOverlay, ServerSelection};

/// Inspection outcome for one `(instance, server)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Ok,
    Err,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Ok => f.write_str("OK"),
            ServerStatus::Err => f.write_str("ERR"),
        }
    }
}

/// Everything the review UI reads and writes, keyed by the composite
/// `"<instance>/<server>"` string.
pub struct ReviewSession {
    tools: BTreeMap<String, Vec<ToolDescriptor>>,
    status: BTreeMap<String, ServerStatus>,
    errors: BTreeMap<String, String>,
    overlay: CompositeOverlay,
    launch_mode: String,
}

impl ReviewSession {
    /// Seed a session. A prior persisted overlay, when present, is the
    /// mandatory starting point; its `last_launch` seeds the launch mode.
    pub fn new(
        tools: BTreeMap<String, Vec<ToolDescriptor>>,
        status: BTreeMap<String, ServerStatus>,
        errors: BTreeMap<String, String>,
        seed: Option<CompositeOverlay>,
    ) -> Self {
        let overlay = seed.unwrap_or_default();
        let launch_mode = overlay.last_launch.clone();
        Self {
            tools,
            status,
            errors,
            overlay,
            launch_mode,
        }
    }

    /// All server keys visible to the UI, errored ones included.
    pub fn server_keys(&self) -> Vec<&str> {
        self.status.keys().map(String::as_str).collect()
    }

    pub fn tools_for(&self, key: &str) -> &[ToolDescriptor] {
        self.tools.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn status_for(&self, key: &str) -> ServerStatus {
        self.status.get(key).copied().unwrap_or(ServerStatus::Err)
    }

    pub fn error_for(&self, key: &str) -> Option<&str> {
        self.errors.get(key).map(String::as_str)
    }

    pub fn selection(&self, key: &str) -> Option<&ServerSelection> {
        self.overlay.servers.get(key)
    }

    pub fn launch_mode(&self) -> &str {
        &self.launch_mode
    }

    pub fn set_launch_mode(&mut self, mode: &str) {
        self.launch_mode = mode.to_string();
    }

    fn entry(&mut self, key: &str) -> &mut ServerSelection {
        self.overlay.servers.entry(key.to_string()).or_default()
    }

    /// Flip the disabled flag for a server.
    pub fn toggle_disabled(&mut self, key: &str) -> bool {
        let entry = self.entry(key);
        entry.disabled = !entry.disabled;
        entry.disabled
    }

    /// Install an explicit allow-set. An empty set blocks every tool.
    pub fn set_allow(&mut self, key: &str, tools: BTreeSet<String>) {
        self.entry(key).allow = Some(tools);
    }

    /// Drop the allow-set, falling back to deny-set semantics.
    pub fn clear_allow(&mut self, key: &str) {
        self.entry(key).allow = None;
    }

    pub fn add_deny(&mut self, key: &str, tool: &str) {
        self.entry(key).deny.insert(tool.to_string());
    }

    pub fn remove_deny(&mut self, key: &str, tool: &str) {
        self.entry(key).deny.remove(tool);
    }

    /// Set a description override; an empty text clears it.
    pub fn set_description(&mut self, key: &str, tool: &str, text: &str) {
        let entry = self.entry(key);
        if text.is_empty() {
            entry.descriptions.remove(tool);
        } else {
            entry
                .descriptions
                .insert(tool.to_string(), text.to_string());
        }
    }

    /// Finish the review: return the edited overlay (uncurated entries
    /// pruned, `last_launch` stamped) plus the chosen launch mode.
    pub fn accept(mut self) -> (CompositeOverlay, String) {
        self.overlay
            .servers
            .retain(|_, selection| !selection.is_default());
        self.overlay.last_launch = self.launch_mode.clone();
        (self.overlay, self.launch_mode)
    }
}

/// The seam between the preflight driver and whatever edits the overlay.
/// `None` means the operator cancelled; nothing is launched.
pub trait OverlayEditor {
    fn review(&mut self, session: ReviewSession) -> Option<(CompositeOverlay, String)>;
}

/// Non-interactive editor: accepts the seeded overlay unchanged. Used when
/// no interactive frontend is attached.
pub struct AcceptSeed;

impl OverlayEditor for AcceptSeed {
    fn review(&mut self, session: ReviewSession) -> Option<(CompositeOverlay, String)> {
        Some(session.accept())
    }
}
