//! Local port reservation for parallel stacks.
//!
//! A port is reserved by actually binding `127.0.0.1:p` and closing the
//! listener. The window between "was bindable" and "child binds it" is
//! accepted: the gateway's own bind is the authoritative failure signal, and
//! the supervisor treats a readiness timeout as fatal for that instance only.

use std::collections::BTreeSet;
use std::net::TcpListener;

use crate::error::LaunchError;

/// Upper bound on probes above the preferred port.
pub const MAX_PROBES: u16 = 4096;

/// Check whether a port is currently bindable on loopback.
pub fn is_port_available(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// Reserve the first port `>= base` that is neither in `taken` nor bound by
/// another process. Probes at most [`MAX_PROBES`] candidates.
///
/// Callers that would rather not wedge the whole run fall back to `base`
/// when this returns `PortExhausted`.
pub fn reserve_port(base: u16, taken: &BTreeSet<u16>) -> crate::Result<u16> {
    for offset in 0..MAX_PROBES {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        if taken.contains(&port) {
            continue;
        }
        if is_port_available(port) {
            tracing::debug!(port = %port, base = %base, "reserved port");
            return Ok(port);
        }
    }
    Err(LaunchError::PortExhausted(base, MAX_PROBES))
}
