//! Final operator report: per-stack URLs, keys, counts, and warnings.

use std::fmt::Write;

use crate::instance::Instance;

/// Hosted Actions importers cap a spec at 30 operations.
pub const OPERATION_LIMIT: usize = 30;
/// Start warning a little before the cap.
pub const OPERATION_WARN_NEAR: usize = 28;

/// Warning tag for an instance's total operation count, if any.
pub fn operation_warning(count: usize) -> Option<&'static str> {
    if count > OPERATION_LIMIT {
        Some("⚠ OVER 30-limit")
    } else if count >= OPERATION_WARN_NEAR {
        Some("⚠ near 30")
    } else {
        None
    }
}

/// Render the post-launch report for all started stacks. Verbose mode
/// enumerates each long-description operation instead of only counting them.
pub fn render_report(instances: &[Instance], verbose: bool) -> String {
    let mut out = String::new();
    for instance in instances {
        let _ = writeln!(out, "=== stack {} ===", instance.name);
        let _ = writeln!(
            out,
            "  Front:   {}  (serves /openapi.json; proxies to mcpo)",
            instance.local_url()
        );
        let _ = writeln!(
            out,
            "  Gateway: http://127.0.0.1:{}",
            instance.gateway_port
        );
        match &instance.public_url {
            Some(url) => {
                let _ = writeln!(out, "  Public:  {url}");
            }
            None => {
                let _ = writeln!(out, "  Public:  (none)");
            }
        }
        let _ = writeln!(out, "  OpenAPI: {}", instance.openapi_url());
        let _ = writeln!(out, "  API key (X-API-Key): {}", instance.api_key);

        let ops = instance.diagnostics.operation_count;
        let mut line = format!(
            "  Servers: {}   Operations: {}",
            instance.tool_names.len(),
            ops
        );
        if let Some(warning) = operation_warning(ops) {
            line.push_str("  ");
            line.push_str(warning);
        }
        let _ = writeln!(out, "{line}");

        for (server, count) in &instance.diagnostics.per_server_operations {
            let long = instance
                .diagnostics
                .long_descriptions
                .get(server)
                .map(Vec::len)
                .unwrap_or(0);
            if long > 0 {
                let _ = writeln!(
                    out,
                    "    {server}: {count} ops, {long} description(s) over 300 graphemes"
                );
            } else {
                let _ = writeln!(out, "    {server}: {count} ops");
            }
            if verbose {
                if let Some(warnings) = instance.diagnostics.long_descriptions.get(server) {
                    for warning in warnings {
                        let _ = writeln!(out, "      {warning}");
                    }
                }
            }
        }
        out.push('\n');
    }
    out
}
