//! OpenAPI merger: fetches per-tool documents from the gateway, namespaces
//! local component references, prefixes paths, applies operator overrides,
//! cleans response schemas, and emits one merged 3.1.0 document.
//!
//! The gateway advertises every configured server's tools regardless of the
//! overlay, so allow/deny and description overrides are enforced here, not in
//! the cloned config. Server order is lexicographic; local `$ref`s are
//! rewritten only when they point at a component name the contributing
//! document actually defines — foreign refs pass through untouched and are
//! surfaced by the post-merge audit instead.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::{Value, json};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::StackConfig;
use crate::error::LaunchError;
use crate::instance::{Instance, InstanceDiagnostics};
use crate::overlay::NestedOverlay;

/// Component sections managed by the merger. Refs into any other section are
/// left alone.
pub const SECTIONS: [&str; 4] = ["schemas", "parameters", "responses", "requestBodies"];

/// HTTP-method keys counted as operations on a path item.
pub const HTTP_METHODS: [&str; 9] = [
    "get", "post", "put", "delete", "patch", "options", "head", "trace", "connect",
];

/// Grapheme budget for operation descriptions before a warning is recorded.
pub const DESCRIPTION_LIMIT: usize = 300;

/// Header carrying the gateway API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of merging one instance.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Serialized merged document.
    pub bytes: Vec<u8>,
    pub diagnostics: InstanceDiagnostics,
    /// Deduplicated `$ref` strings that point into a managed section but
    /// have no target. Reported, never fixed up.
    pub dangling_refs: Vec<String>,
}

/// Fetch every enabled server's per-tool OpenAPI from the gateway and merge.
pub async fn merge_instance(
    instance: &Instance,
    config: &StackConfig,
    overlay: &NestedOverlay,
    base_url: &str,
) -> crate::Result<MergeOutcome> {
    if config.mcp_servers.is_empty() {
        return Err(LaunchError::EmptyConfig(
            instance.config_path.display().to_string(),
        ));
    }
    let specs = fetch_server_specs(instance, config, overlay).await?;
    merge_documents(&instance.name, &specs, overlay, base_url)
}

/// Fetch `http://127.0.0.1:<gateway>/<server>/openapi.json` for each enabled
/// server, in lexicographic order. A non-200 fails the whole merge for this
/// instance with the response body attached.
pub async fn fetch_server_specs(
    instance: &Instance,
    config: &StackConfig,
    overlay: &NestedOverlay,
) -> crate::Result<Vec<(String, Value)>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| LaunchError::Fetch("client".to_string(), e.to_string()))?;

    let mut specs = Vec::new();
    for server in config.mcp_servers.keys() {
        if overlay.is_disabled(&instance.name, server) {
            tracing::debug!(instance = %instance.name, server = %server, "skipping disabled server");
            continue;
        }
        let url = format!(
            "http://127.0.0.1:{}/{}/openapi.json",
            instance.gateway_port, server
        );
        let response = client
            .get(&url)
            .header(API_KEY_HEADER, &instance.api_key)
            .send()
            .await
            .map_err(|e| LaunchError::Fetch(url.clone(), e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LaunchError::Fetch(url.clone(), e.to_string()))?;
        if status.as_u16() != 200 {
            return Err(LaunchError::Fetch(url, format!("status {status}\n{body}")));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| LaunchError::Parse(url, e.to_string()))?;
        specs.push((server.clone(), value));
    }
    Ok(specs)
}

/// Merge already-fetched per-server documents. Pure — no I/O — so the whole
/// pipeline is testable without a gateway.
pub fn merge_documents(
    instance_name: &str,
    specs: &[(String, Value)],
    overlay: &NestedOverlay,
    base_url: &str,
) -> crate::Result<MergeOutcome> {
    let mut merged = json!({
        "openapi": "3.1.0",
        "info": {
            "title": format!("MCP Tools via mcpo ({instance_name})"),
            "version": "1.0.0",
        },
        "servers": [{"url": base_url.trim_end_matches('/')}],
        "components": {
            "securitySchemes": {
                "mcpoApiKey": {"type": "apiKey", "in": "header", "name": API_KEY_HEADER},
            },
            "schemas": {},
            "parameters": {},
            "responses": {},
            "requestBodies": {},
        },
        "security": [{"mcpoApiKey": []}],
        "paths": {},
    });
    let mut diagnostics = InstanceDiagnostics::default();

    for (server, original) in specs {
        // Local component names are recorded from the original document,
        // before any mutation.
        let local = local_component_names(original);
        let mut doc = original.clone();
        rewrite_refs(&mut doc, server, &local);

        if let Some(components) = doc.get("components").and_then(Value::as_object) {
            for section in SECTIONS {
                let Some(entries) = components.get(section).and_then(Value::as_object) else {
                    continue;
                };
                for (key, value) in entries {
                    let namespaced = format!("{server}__{key}");
                    merged["components"][section][namespaced.as_str()] = value.clone();
                }
            }
        }

        let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
            // Servers without paths still contribute components.
            continue;
        };
        for (raw_path, item) in paths {
            let tool = first_path_segment(raw_path);
            if !overlay.allowed(instance_name, server, tool) {
                tracing::debug!(
                    instance = %instance_name,
                    server = %server,
                    tool = %tool,
                    "tool filtered by overlay"
                );
                continue;
            }
            let merged_path = format!(
                "/{}{}",
                server.trim_start_matches('/'),
                ensure_leading_slash(raw_path)
            );

            let mut item = item.clone();
            if let Some(map) = item.as_object_mut() {
                for (method, op) in map.iter_mut() {
                    if !HTTP_METHODS.contains(&method.as_str()) {
                        continue;
                    }
                    let Some(op) = op.as_object_mut() else { continue };

                    let existing = op
                        .get("operationId")
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string);
                    let operation_id = match existing {
                        Some(id) => format!("{server}__{id}"),
                        None => format!(
                            "{server}__{}_{}",
                            method.to_lowercase(),
                            sanitize_for_id(raw_path)
                        ),
                    };
                    op.insert("operationId".to_string(), Value::String(operation_id));

                    if let Some(text) =
                        overlay.description_override(instance_name, server, tool)
                    {
                        op.insert("description".to_string(), Value::String(text.to_string()));
                    }

                    if let Some(description) = op.get("description").and_then(Value::as_str) {
                        let length = description.graphemes(true).count();
                        if length > DESCRIPTION_LIMIT {
                            diagnostics
                                .long_descriptions
                                .entry(server.clone())
                                .or_default()
                                .push(format!(
                                    "{} {} (tool={}): description length {} > {}",
                                    method.to_uppercase(),
                                    merged_path,
                                    tool,
                                    length,
                                    DESCRIPTION_LIMIT
                                ));
                        }
                    }

                    // Operations rely on the top-level security requirement.
                    op.remove("security");

                    *diagnostics
                        .per_server_operations
                        .entry(server.clone())
                        .or_default() += 1;
                    diagnostics.operation_count += 1;
                }
            }
            merged["paths"][merged_path.as_str()] = item;
        }
    }

    tighten_responses(&mut merged);
    coerce_integer_types(&mut merged);

    let bytes = serde_json::to_vec_pretty(&merged)
        .map_err(|e| LaunchError::Parse("merged spec".to_string(), e.to_string()))?;
    let dangling_refs = audit_refs(&merged);

    Ok(MergeOutcome {
        bytes,
        diagnostics,
        dangling_refs,
    })
}

/// First segment of a raw path: `/read_text_file/sub` → `read_text_file`.
/// This is the authoritative tool-name rule.
pub fn first_path_segment(raw_path: &str) -> &str {
    raw_path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
}

fn ensure_leading_slash(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Replace every non-alphanumeric with `_` for synthesized operation ids.
pub fn sanitize_for_id(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Names defined in each managed component section of one document.
fn local_component_names(doc: &Value) -> BTreeMap<String, BTreeSet<String>> {
    let mut local = BTreeMap::new();
    let components = doc.get("components").and_then(Value::as_object);
    for section in SECTIONS {
        let names: BTreeSet<String> = components
            .and_then(|c| c.get(section))
            .and_then(Value::as_object)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        local.insert(section.to_string(), names);
    }
    local
}

/// `#/components/<section>/<name>` for a managed section, or `None`.
fn parse_component_ref(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix("#/components/")?;
    let (section, name) = rest.split_once('/')?;
    if !SECTIONS.contains(&section) || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((section, name))
}

/// Rewrite local `$ref`s to their namespaced targets. Refs to unknown names
/// or unmanaged sections are left untouched.
fn rewrite_refs(value: &mut Value, server: &str, local: &BTreeMap<String, BTreeSet<String>>) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key == "$ref" {
                    let Some(target) = entry.as_str() else { continue };
                    let Some((section, name)) = parse_component_ref(target) else {
                        continue;
                    };
                    let is_local = local.get(section).map(|s| s.contains(name)).unwrap_or(false);
                    if is_local {
                        *entry = Value::String(format!("#/components/{section}/{server}__{name}"));
                    }
                } else {
                    rewrite_refs(entry, server, local);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                rewrite_refs(entry, server, local);
            }
        }
        _ => {}
    }
}

/// Ensure every response has a description, prune empty schemas and `anyOf`
/// `{}` branches, and delete emptied `content` blocks.
fn tighten_responses(doc: &mut Value) {
    let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) else {
        return;
    };
    for item in paths.values_mut() {
        let Some(item) = item.as_object_mut() else { continue };
        for (method, op) in item.iter_mut() {
            if !HTTP_METHODS.contains(&method.as_str()) {
                continue;
            }
            let Some(responses) = op.get_mut("responses").and_then(Value::as_object_mut) else {
                continue;
            };
            for response in responses.values_mut() {
                tighten_response(response);
            }
        }
    }
}

fn tighten_response(response: &mut Value) {
    let Some(obj) = response.as_object_mut() else { return };
    if obj.contains_key("$ref") {
        return;
    }
    if !obj.contains_key("description") {
        obj.insert(
            "description".to_string(),
            Value::String("Successful Response".to_string()),
        );
    }
    let mut drop_content = false;
    if let Some(content) = obj.get_mut("content").and_then(Value::as_object_mut) {
        let media_types: Vec<String> = content.keys().cloned().collect();
        for media_type in media_types {
            let prune = match content.get_mut(&media_type).and_then(Value::as_object_mut) {
                Some(media) => match media.get_mut("schema") {
                    Some(schema) => {
                        collapse_any_of(schema);
                        is_empty_object(schema)
                    }
                    None => false,
                },
                None => false,
            };
            if prune {
                content.remove(&media_type);
            }
        }
        drop_content = content.is_empty();
    }
    if drop_content {
        obj.remove("content");
    }
}

enum AnyOfAction {
    Keep,
    RemoveKey,
    Replace(Value),
}

/// Remove `{}` branches from an `anyOf`; a single survivor replaces the
/// wrapper, zero survivors remove the key (leaving `{}` for the caller to
/// prune).
fn collapse_any_of(schema: &mut Value) {
    let action = {
        let Some(obj) = schema.as_object_mut() else { return };
        match obj.get_mut("anyOf").and_then(Value::as_array_mut) {
            None => return,
            Some(branches) => {
                branches.retain(|branch| !is_empty_object(branch));
                if branches.is_empty() {
                    AnyOfAction::RemoveKey
                } else if branches.len() == 1 {
                    AnyOfAction::Replace(branches[0].clone())
                } else {
                    AnyOfAction::Keep
                }
            }
        }
    };
    match action {
        AnyOfAction::Keep => {}
        AnyOfAction::RemoveKey => {
            if let Some(obj) = schema.as_object_mut() {
                obj.remove("anyOf");
            }
        }
        AnyOfAction::Replace(branch) => *schema = branch,
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

/// Coerce `"number"` schemas with integral defaults, all-integral enums, or
/// integral `multipleOf` to `"integer"`. No `format` guessing.
fn coerce_integer_types(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let is_number = map.get("type").and_then(Value::as_str) == Some("number");
            if is_number {
                let default_ok = map.get("default").map(is_integral_number).unwrap_or(false);
                let enum_ok = map
                    .get("enum")
                    .and_then(Value::as_array)
                    .map(|entries| !entries.is_empty() && entries.iter().all(is_integral_number))
                    .unwrap_or(false);
                let multiple_ok = map
                    .get("multipleOf")
                    .map(is_integral_number)
                    .unwrap_or(false);
                if default_ok || enum_ok || multiple_ok {
                    map.insert("type".to_string(), Value::String("integer".to_string()));
                }
            }
            for entry in map.values_mut() {
                coerce_integer_types(entry);
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                coerce_integer_types(entry);
            }
        }
        _ => {}
    }
}

fn is_integral_number(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.as_i64().is_some()
                || n.as_u64().is_some()
                || n.as_f64()
                    .map(|f| f.is_finite() && f.fract() == 0.0)
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Walk the merged document and report every `$ref` into a managed section
/// whose target key does not exist. Deduplicated; does not mutate.
pub fn audit_refs(doc: &Value) -> Vec<String> {
    let mut missing = BTreeSet::new();
    collect_dangling(doc, doc, &mut missing);
    missing.into_iter().collect()
}

fn collect_dangling(node: &Value, doc: &Value, missing: &mut BTreeSet<String>) {
    match node {
        Value::Object(map) => {
            for (key, entry) in map {
                if key == "$ref" {
                    let Some(target) = entry.as_str() else { continue };
                    let Some((section, name)) = parse_component_ref(target) else {
                        continue;
                    };
                    let exists = doc
                        .get("components")
                        .and_then(|c| c.get(section))
                        .and_then(|s| s.get(name))
                        .is_some();
                    if !exists {
                        missing.insert(target.to_string());
                    }
                } else {
                    collect_dangling(entry, doc, missing);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                collect_dangling(entry, doc, missing);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{CompositeOverlay, ServerSelection};

    fn no_overlay(instances: &[&str]) -> NestedOverlay {
        let known: Vec<String> = instances.iter().map(|s| s.to_string()).collect();
        NestedOverlay::from_composite(&CompositeOverlay::default(), &known)
    }

    fn overlay_with(key: &str, selection: ServerSelection, instances: &[&str]) -> NestedOverlay {
        let mut composite = CompositeOverlay::default();
        composite.servers.insert(key.to_string(), selection);
        let known: Vec<String> = instances.iter().map(|s| s.to_string()).collect();
        NestedOverlay::from_composite(&composite, &known)
    }

    fn fs_spec() -> Value {
        json!({
            "openapi": "3.1.0",
            "paths": {
                "/read_file": {
                    "post": {
                        "operationId": "read_file_post",
                        "description": "Read a file",
                        "security": [{"HTTPBearer": []}],
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": {"$ref": "#/components/schemas/ReadReq"}
                                }
                            }
                        },
                        "responses": {
                            "200": {
                                "description": "OK",
                                "content": {
                                    "application/json": {"schema": {"$ref": "#/components/schemas/ReadResp"}}
                                }
                            }
                        }
                    }
                },
                "/dangerous": {
                    "post": {"responses": {"200": {"description": "OK"}}}
                }
            },
            "components": {
                "schemas": {
                    "ReadReq": {"type": "object"},
                    "ReadResp": {"type": "object", "properties": {"req": {"$ref": "#/components/schemas/ReadReq"}}}
                }
            }
        })
    }

    fn merged_value(outcome: &MergeOutcome) -> Value {
        serde_json::from_slice(&outcome.bytes).unwrap()
    }

    #[test]
    fn test_paths_prefixed_and_operation_ids_namespaced() {
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);

        let op = &doc["paths"]["/fs/read_file"]["post"];
        assert_eq!(op["operationId"], "fs__read_file_post");
        // All paths carry the server prefix.
        for path in doc["paths"].as_object().unwrap().keys() {
            assert!(path.starts_with("/fs/"), "unprefixed path {path}");
        }
    }

    #[test]
    fn test_synthesized_operation_id() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/read-file/sub": {"get": {"responses": {}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert_eq!(
            doc["paths"]["/fs/read-file/sub"]["get"]["operationId"],
            "fs__get__read_file_sub"
        );
    }

    #[test]
    fn test_local_refs_rewritten_and_components_moved() {
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);

        let schema_ref = &doc["paths"]["/fs/read_file"]["post"]["requestBody"]["content"]
            ["application/json"]["schema"]["$ref"];
        assert_eq!(schema_ref, "#/components/schemas/fs__ReadReq");
        // Nested ref inside a moved component is rewritten too.
        assert_eq!(
            doc["components"]["schemas"]["fs__ReadResp"]["properties"]["req"]["$ref"],
            "#/components/schemas/fs__ReadReq"
        );
        assert!(doc["components"]["schemas"].get("ReadReq").is_none());
        assert!(outcome.dangling_refs.is_empty());
    }

    #[test]
    fn test_foreign_ref_left_alone_and_audited() {
        let specs = vec![(
            "fs".to_string(),
            json!({
                "paths": {
                    "/t": {"get": {"responses": {"200": {
                        "description": "OK",
                        "content": {"application/json": {"schema": {"$ref": "#/components/schemas/NotLocal"}}}
                    }}}}
                }
            }),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert_eq!(
            doc["paths"]["/fs/t"]["get"]["responses"]["200"]["content"]["application/json"]
                ["schema"]["$ref"],
            "#/components/schemas/NotLocal"
        );
        assert_eq!(
            outcome.dangling_refs,
            vec!["#/components/schemas/NotLocal".to_string()]
        );
    }

    #[test]
    fn test_unmanaged_section_ref_ignored_by_audit() {
        let specs = vec![(
            "fs".to_string(),
            json!({
                "paths": {"/t": {"get": {
                    "responses": {"200": {"description": "OK"}},
                    "callbacks": {"x": {"$ref": "#/components/callbacks/Whatever"}}
                }}}
            }),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        assert!(outcome.dangling_refs.is_empty());
    }

    #[test]
    fn test_disabled_server_is_not_merged() {
        // merge_documents never sees disabled servers (the fetch skips them),
        // but a disabled entry must also gate tools if it slips through.
        let overlay = overlay_with(
            "alpha/fs",
            ServerSelection {
                disabled: true,
                ..Default::default()
            },
            &["alpha"],
        );
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome = merge_documents("alpha", &specs, &overlay, "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(doc["paths"].as_object().unwrap().is_empty());
        assert_eq!(outcome.diagnostics.operation_count, 0);
    }

    #[test]
    fn test_deny_removes_single_tool_path() {
        let overlay = overlay_with(
            "alpha/fs",
            ServerSelection {
                deny: ["dangerous".to_string()].into_iter().collect(),
                ..Default::default()
            },
            &["alpha"],
        );
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome = merge_documents("alpha", &specs, &overlay, "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(doc["paths"].get("/fs/dangerous").is_none());
        assert!(doc["paths"].get("/fs/read_file").is_some());
    }

    #[test]
    fn test_empty_allow_set_emits_no_paths() {
        let overlay = overlay_with(
            "alpha/fs",
            ServerSelection {
                allow: Some(BTreeSet::new()),
                ..Default::default()
            },
            &["alpha"],
        );
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome = merge_documents("alpha", &specs, &overlay, "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(doc["paths"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_description_override_applied_verbatim() {
        let override_text = "Curated search description";
        let overlay = overlay_with(
            "beta/web",
            ServerSelection {
                descriptions: [("search".to_string(), override_text.to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            &["beta"],
        );
        let specs = vec![(
            "web".to_string(),
            json!({"paths": {"/search": {"post": {
                "operationId": "search_post",
                "description": "original",
                "responses": {"200": {"description": "OK"}}
            }}}}),
        )];
        let outcome = merge_documents("beta", &specs, &overlay, "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert_eq!(
            doc["paths"]["/web/search"]["post"]["description"],
            override_text
        );
        assert!(outcome.diagnostics.long_descriptions.is_empty());
    }

    #[test]
    fn test_description_warning_boundary() {
        for (len, expect_warning) in [(300usize, false), (301, true)] {
            let text = "x".repeat(len);
            let specs = vec![(
                "web".to_string(),
                json!({"paths": {"/search": {"post": {
                    "description": text,
                    "responses": {"200": {"description": "OK"}}
                }}}}),
            )];
            let outcome =
                merge_documents("beta", &specs, &no_overlay(&["beta"]), "http://x").unwrap();
            let warned = outcome
                .diagnostics
                .long_descriptions
                .get("web")
                .map(|w| !w.is_empty())
                .unwrap_or(false);
            assert_eq!(warned, expect_warning, "length {len}");
            if expect_warning {
                let line = &outcome.diagnostics.long_descriptions["web"][0];
                assert_eq!(line, "POST /web/search (tool=search): description length 301 > 300");
            }
        }
    }

    #[test]
    fn test_grapheme_counting_not_bytes() {
        // 160 two-byte graphemes stay under the limit even though the byte
        // length is over 300.
        let text = "é".repeat(160);
        assert!(text.len() > 300);
        let specs = vec![(
            "web".to_string(),
            json!({"paths": {"/search": {"post": {
                "description": text,
                "responses": {"200": {"description": "OK"}}
            }}}}),
        )];
        let outcome =
            merge_documents("beta", &specs, &no_overlay(&["beta"]), "http://x").unwrap();
        assert!(outcome.diagnostics.long_descriptions.is_empty());
    }

    #[test]
    fn test_per_operation_security_deleted_top_level_present() {
        let specs = vec![("fs".to_string(), fs_spec())];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(doc["paths"]["/fs/read_file"]["post"].get("security").is_none());
        assert_eq!(doc["security"][0]["mcpoApiKey"], json!([]));
        assert_eq!(
            doc["components"]["securitySchemes"]["mcpoApiKey"]["name"],
            API_KEY_HEADER
        );
    }

    #[test]
    fn test_response_description_defaulted() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/t": {"get": {"responses": {"200": {}}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert_eq!(
            doc["paths"]["/fs/t"]["get"]["responses"]["200"]["description"],
            "Successful Response"
        );
    }

    #[test]
    fn test_empty_schema_prunes_media_type_and_content() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/t": {"get": {"responses": {"200": {
                "description": "OK",
                "content": {"application/json": {"schema": {}}}
            }}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(
            doc["paths"]["/fs/t"]["get"]["responses"]["200"]
                .get("content")
                .is_none()
        );
    }

    #[test]
    fn test_any_of_empty_branch_pruned() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/t": {"get": {"responses": {"200": {
                "description": "OK",
                "content": {"application/json": {"schema": {
                    "anyOf": [{"type": "string"}, {}, {"type": "integer"}]
                }}}
            }}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        let any_of = doc["paths"]["/fs/t"]["get"]["responses"]["200"]["content"]
            ["application/json"]["schema"]["anyOf"]
            .as_array()
            .unwrap();
        assert_eq!(any_of.len(), 2);
        assert!(any_of.iter().all(|b| !b.as_object().unwrap().is_empty()));
    }

    #[test]
    fn test_any_of_single_survivor_collapses() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/t": {"get": {"responses": {"200": {
                "description": "OK",
                "content": {"application/json": {"schema": {"anyOf": [{}, {"type": "string"}]}}}
            }}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        let schema =
            &doc["paths"]["/fs/t"]["get"]["responses"]["200"]["content"]["application/json"]["schema"];
        assert_eq!(schema, &json!({"type": "string"}));
    }

    #[test]
    fn test_any_of_all_empty_prunes_media_type() {
        let specs = vec![(
            "fs".to_string(),
            json!({"paths": {"/t": {"get": {"responses": {"200": {
                "description": "OK",
                "content": {"application/json": {"schema": {"anyOf": [{}, {}]}}}
            }}}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(
            doc["paths"]["/fs/t"]["get"]["responses"]["200"]
                .get("content")
                .is_none()
        );
    }

    #[test]
    fn test_integer_coercion_cases() {
        let specs = vec![(
            "fs".to_string(),
            json!({
                "paths": {},
                "components": {"schemas": {
                    "A": {"type": "number", "default": 5, "multipleOf": 1},
                    "B": {"type": "number", "default": 5.5},
                    "C": {"type": "number", "enum": [1, 2.0, 3]},
                    "D": {"type": "number", "enum": [1, 2.5]},
                    "E": {"type": "number", "enum": []},
                    "F": {"type": "number", "multipleOf": 0.5}
                }}
            }),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        let schemas = &doc["components"]["schemas"];
        assert_eq!(schemas["fs__A"]["type"], "integer");
        assert_eq!(schemas["fs__A"]["default"], 5);
        assert_eq!(schemas["fs__B"]["type"], "number");
        assert_eq!(schemas["fs__C"]["type"], "integer");
        assert_eq!(schemas["fs__D"]["type"], "number");
        assert_eq!(schemas["fs__E"]["type"], "number");
        assert_eq!(schemas["fs__F"]["type"], "number");
    }

    #[test]
    fn test_operation_counts_per_server() {
        let specs = vec![
            ("data".to_string(), json!({"paths": {
                "/query": {"get": {"responses": {}}, "post": {"responses": {}}}
            }})),
            ("fs".to_string(), fs_spec()),
        ];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        assert_eq!(outcome.diagnostics.per_server_operations["data"], 2);
        assert_eq!(outcome.diagnostics.per_server_operations["fs"], 2);
        assert_eq!(outcome.diagnostics.operation_count, 4);
    }

    #[test]
    fn test_operation_ids_unique_across_servers() {
        let tool = json!({"paths": {"/go": {"get": {"operationId": "go", "responses": {}}}}});
        let specs = vec![
            ("a".to_string(), tool.clone()),
            ("b".to_string(), tool),
        ];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        let mut ids = BTreeSet::new();
        for item in doc["paths"].as_object().unwrap().values() {
            for (method, op) in item.as_object().unwrap() {
                if HTTP_METHODS.contains(&method.as_str()) {
                    let id = op["operationId"].as_str().unwrap().to_string();
                    assert!(ids.insert(id.clone()), "duplicate operationId {id}");
                    let prefix_ok = id.starts_with("a__") || id.starts_with("b__");
                    assert!(prefix_ok, "operationId {id} missing server prefix");
                }
            }
        }
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_server_without_paths_still_contributes_components() {
        let specs = vec![(
            "lib".to_string(),
            json!({"components": {"schemas": {"Shared": {"type": "object"}}}}),
        )];
        let outcome =
            merge_documents("alpha", &specs, &no_overlay(&["alpha"]), "http://x").unwrap();
        let doc = merged_value(&outcome);
        assert!(doc["components"]["schemas"].get("lib__Shared").is_some());
        assert!(doc["paths"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_merge_is_deterministic() {
        let specs = vec![("fs".to_string(), fs_spec())];
        let overlay = no_overlay(&["alpha"]);
        let first = merge_documents("alpha", &specs, &overlay, "http://x").unwrap();
        let second = merge_documents("alpha", &specs, &overlay, "http://x").unwrap();
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn test_skeleton_title_and_server_url() {
        let outcome = merge_documents("alpha", &[], &no_overlay(&["alpha"]), "http://pub/").unwrap();
        let doc = merged_value(&outcome);
        assert_eq!(doc["openapi"], "3.1.0");
        assert_eq!(doc["info"]["title"], "MCP Tools via mcpo (alpha)");
        assert_eq!(doc["servers"][0]["url"], "http://pub");
    }

    #[test]
    fn test_first_path_segment() {
        assert_eq!(first_path_segment("/read_text_file"), "read_text_file");
        assert_eq!(first_path_segment("/a/b/c"), "a");
        assert_eq!(first_path_segment("bare"), "bare");
        assert_eq!(first_path_segment("/"), "");
    }

    #[test]
    fn test_sanitize_for_id() {
        assert_eq!(sanitize_for_id("/read-file/sub"), "_read_file_sub");
        assert_eq!(sanitize_for_id("abc123"), "abc123");
    }
}
