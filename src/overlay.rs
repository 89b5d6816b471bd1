//! Operator-curated overlay: disabled servers, allow/deny tool filters, and
//! per-tool description overrides.
//!
//! Two equivalent shapes exist on purpose. The composite form keys entries by
//! `"<instance>/<server>"` — one flat string per server — which is what the
//! review UI edits and what persists to `.mcp-launch/overrides.json`. The
//! nested form reshapes the same data as `instance → server → selection` for
//! cheap runtime lookups. Neither is derivable without the key-split rule, so
//! both live here along with the translation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LaunchError;

/// File name of the persisted composite overlay, under the state dir.
pub const OVERRIDES_FILE: &str = "overrides.json";

fn is_false(b: &bool) -> bool {
    !*b
}

/// Curation state for one `(instance, server)` pair.
///
/// `allow` distinguishes "no allow-list" (`None`) from "allow-list present
/// but empty" (`Some` with an empty set) — the latter blocks every tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSelection {
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub descriptions: BTreeMap<String, String>,
}

impl ServerSelection {
    /// True when this selection carries no curation at all.
    pub fn is_default(&self) -> bool {
        !self.disabled
            && self.allow.is_none()
            && self.deny.is_empty()
            && self.descriptions.is_empty()
    }

    /// Tool gate for this server: disabled rejects everything; an explicit
    /// allow-set rejects non-members; otherwise the deny-set rejects members.
    pub fn allows(&self, tool: &str) -> bool {
        if self.disabled {
            return false;
        }
        if let Some(allow) = &self.allow {
            return allow.contains(tool);
        }
        !self.deny.contains(tool)
    }
}

/// The persisted, UI-facing overlay: flat `"<instance>/<server>"` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeOverlay {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSelection>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_launch: String,
}

/// Join an instance and server name into a composite overlay key.
pub fn composite_key(instance: &str, server: &str) -> String {
    format!("{instance}/{server}")
}

/// Split a composite key on its first `/`. Server names may themselves
/// contain slashes; instance names cannot.
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

/// The runtime overlay shape: `instance → server → selection`.
///
/// Every known instance has an entry (possibly empty) so lookups never need
/// to distinguish "instance unknown" from "instance uncurated".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedOverlay {
    pub instances: BTreeMap<String, BTreeMap<String, ServerSelection>>,
}

impl NestedOverlay {
    /// Reshape a composite overlay, keeping only entries whose instance part
    /// is in `known_instances` and materializing empty maps for the rest.
    pub fn from_composite(composite: &CompositeOverlay, known_instances: &[String]) -> Self {
        let mut instances: BTreeMap<String, BTreeMap<String, ServerSelection>> = known_instances
            .iter()
            .map(|name| (name.clone(), BTreeMap::new()))
            .collect();
        for (key, selection) in &composite.servers {
            let Some((instance, server)) = split_composite_key(key) else {
                continue;
            };
            let Some(servers) = instances.get_mut(instance) else {
                // Entry references an instance not part of this run.
                continue;
            };
            servers.insert(server.to_string(), selection.clone());
        }
        NestedOverlay { instances }
    }

    /// Reverse the key split back into the composite form.
    pub fn to_composite(&self, last_launch: &str) -> CompositeOverlay {
        let mut servers = BTreeMap::new();
        for (instance, per_server) in &self.instances {
            for (server, selection) in per_server {
                servers.insert(composite_key(instance, server), selection.clone());
            }
        }
        CompositeOverlay {
            servers,
            last_launch: last_launch.to_string(),
        }
    }

    pub fn selection(&self, instance: &str, server: &str) -> Option<&ServerSelection> {
        self.instances.get(instance).and_then(|m| m.get(server))
    }

    pub fn is_disabled(&self, instance: &str, server: &str) -> bool {
        self.selection(instance, server)
            .map(|s| s.disabled)
            .unwrap_or(false)
    }

    /// Tool gate: uncurated servers allow everything.
    pub fn allowed(&self, instance: &str, server: &str, tool: &str) -> bool {
        match self.selection(instance, server) {
            Some(selection) => selection.allows(tool),
            None => true,
        }
    }

    /// Non-empty description override for a tool, if one is set.
    pub fn description_override(&self, instance: &str, server: &str, tool: &str) -> Option<&str> {
        self.selection(instance, server)
            .and_then(|s| s.descriptions.get(tool))
            .map(String::as_str)
            .filter(|d| !d.is_empty())
    }
}

/// Load the persisted overlay. Missing or malformed files yield `None` —
/// the review starts empty rather than guessing intent.
pub fn load_overlay(state_dir: &Path) -> Option<CompositeOverlay> {
    let path = state_dir.join(OVERRIDES_FILE);
    let data = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(overlay) => Some(overlay),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed overlay file");
            None
        }
    }
}

/// Persist the composite overlay under the state dir.
pub fn save_overlay(state_dir: &Path, overlay: &CompositeOverlay) -> crate::Result<()> {
    std::fs::create_dir_all(state_dir)
        .map_err(|e| LaunchError::State(format!("create {}: {e}", state_dir.display())))?;
    let path = state_dir.join(OVERRIDES_FILE);
    let data = serde_json::to_vec_pretty(overlay)
        .map_err(|e| LaunchError::State(format!("encode overlay: {e}")))?;
    std::fs::write(&path, data)
        .map_err(|e| LaunchError::State(format!("write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(
        disabled: bool,
        allow: Option<&[&str]>,
        deny: &[&str],
        descriptions: &[(&str, &str)],
    ) -> ServerSelection {
        ServerSelection {
            disabled,
            allow: allow.map(|a| a.iter().map(|s| s.to_string()).collect()),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            descriptions: descriptions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_disabled_rejects_all() {
        let s = selection(true, Some(&["read"]), &[], &[]);
        assert!(!s.allows("read"));
        assert!(!s.allows("write"));
    }

    #[test]
    fn test_allow_set_is_exclusive() {
        let s = selection(false, Some(&["read"]), &[], &[]);
        assert!(s.allows("read"));
        assert!(!s.allows("write"));
    }

    #[test]
    fn test_empty_allow_set_rejects_all() {
        let s = selection(false, Some(&[]), &[], &[]);
        assert!(!s.allows("read"));
    }

    #[test]
    fn test_deny_applies_without_allow() {
        let s = selection(false, None, &["dangerous"], &[]);
        assert!(s.allows("read"));
        assert!(!s.allows("dangerous"));
    }

    #[test]
    fn test_allow_takes_precedence_over_deny() {
        // With an explicit allow-set, the deny-set is never consulted.
        let s = selection(false, Some(&["read"]), &["read"], &[]);
        assert!(s.allows("read"));
    }

    #[test]
    fn test_uncurated_server_allows_everything() {
        let nested = NestedOverlay::default();
        assert!(nested.allowed("alpha", "fs", "anything"));
    }

    #[test]
    fn test_split_composite_key_first_slash() {
        assert_eq!(split_composite_key("alpha/fs"), Some(("alpha", "fs")));
        assert_eq!(split_composite_key("alpha/fs/sub"), Some(("alpha", "fs/sub")));
        assert_eq!(split_composite_key("noslash"), None);
    }

    #[test]
    fn test_from_composite_discards_unknown_instances() {
        let mut composite = CompositeOverlay::default();
        composite
            .servers
            .insert("alpha/fs".to_string(), selection(true, None, &[], &[]));
        composite
            .servers
            .insert("ghost/fs".to_string(), selection(true, None, &[], &[]));

        let nested = NestedOverlay::from_composite(&composite, &["alpha".to_string()]);
        assert!(nested.is_disabled("alpha", "fs"));
        assert!(!nested.instances.contains_key("ghost"));
    }

    #[test]
    fn test_from_composite_materializes_known_instances() {
        let nested =
            NestedOverlay::from_composite(&CompositeOverlay::default(), &["beta".to_string()]);
        assert!(nested.instances.contains_key("beta"));
        assert!(nested.instances["beta"].is_empty());
    }

    #[test]
    fn test_composite_nested_round_trip() {
        let mut composite = CompositeOverlay {
            last_launch: "up --tunnel quick".to_string(),
            ..Default::default()
        };
        composite.servers.insert(
            "alpha/fs".to_string(),
            selection(false, None, &["dangerous"], &[]),
        );
        composite.servers.insert(
            "beta/web".to_string(),
            selection(false, Some(&["search"]), &[], &[("search", "override")]),
        );

        let known = vec!["alpha".to_string(), "beta".to_string()];
        let nested = NestedOverlay::from_composite(&composite, &known);
        let round = nested.to_composite(&composite.last_launch);
        assert_eq!(round, composite);
    }

    #[test]
    fn test_round_trip_restricted_to_known_instances() {
        let mut composite = CompositeOverlay::default();
        composite
            .servers
            .insert("alpha/fs".to_string(), selection(true, None, &[], &[]));
        composite
            .servers
            .insert("ghost/fs".to_string(), selection(true, None, &[], &[]));

        let known = vec!["alpha".to_string()];
        let nested = NestedOverlay::from_composite(&composite, &known);
        let round = nested.to_composite("");
        assert_eq!(round.servers.len(), 1);
        assert!(round.servers.contains_key("alpha/fs"));
    }

    #[test]
    fn test_description_override_empty_is_none() {
        let mut nested = NestedOverlay::default();
        nested.instances.insert(
            "alpha".to_string(),
            [(
                "web".to_string(),
                selection(false, None, &[], &[("search", "")]),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(nested.description_override("alpha", "web", "search"), None);
    }

    #[test]
    fn test_load_overlay_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_overlay(dir.path()).is_none());
    }

    #[test]
    fn test_load_overlay_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(OVERRIDES_FILE), b"{not json").unwrap();
        assert!(load_overlay(dir.path()).is_none());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut overlay = CompositeOverlay {
            last_launch: "up".to_string(),
            ..Default::default()
        };
        overlay.servers.insert(
            "alpha/fs".to_string(),
            selection(false, Some(&["read_file"]), &[], &[("read_file", "desc")]),
        );
        save_overlay(dir.path(), &overlay).unwrap();
        let loaded = load_overlay(dir.path()).unwrap();
        assert_eq!(loaded, overlay);
    }
}
