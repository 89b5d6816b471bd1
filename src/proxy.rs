//! Front proxy: serves the merged OpenAPI document and reverse-proxies every
//! other request to the gateway.
//!
//! Three handlers: `GET /openapi.json` (503 until a spec is installed),
//! `GET /healthz`, and a fallback that forwards method, path+query, headers,
//! and streaming bodies to `http://127.0.0.1:<gatewayPort>`. The installed
//! spec sits behind a reader-writer lock so installation is safe while
//! requests are in flight.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::TryStreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::LaunchError;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
struct ProxyState {
    spec: Arc<RwLock<Option<Vec<u8>>>>,
    client: reqwest::Client,
    gateway_base: String,
}

/// Handle to a running front proxy.
pub struct FrontProxyHandle {
    spec: Arc<RwLock<Option<Vec<u8>>>>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    /// Actual bound address (useful when started on port 0).
    pub local_addr: SocketAddr,
}

impl FrontProxyHandle {
    /// Install (or replace) the merged spec served at `/openapi.json`.
    pub async fn install_spec(&self, bytes: Vec<u8>) {
        let mut guard = self.spec.write().await;
        *guard = Some(bytes);
    }

    /// Graceful shutdown, bounded by `grace`.
    pub async fn close(self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            tracing::warn!("front proxy did not stop within the grace period");
        }
    }
}

/// Bind `127.0.0.1:<front_port>` and start serving. Port 0 picks an
/// ephemeral port; read it back from `local_addr`.
pub async fn start_front_proxy(
    front_port: u16,
    gateway_port: u16,
) -> crate::Result<FrontProxyHandle> {
    let spec: Arc<RwLock<Option<Vec<u8>>>> = Arc::new(RwLock::new(None));
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| LaunchError::Proxy(format!("build client: {e}")))?;
    let state = ProxyState {
        spec: spec.clone(),
        client,
        gateway_base: format!("http://127.0.0.1:{gateway_port}"),
    };

    let app = Router::new()
        .route("/openapi.json", get(serve_spec))
        .route("/healthz", get(healthz))
        .fallback(forward)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", front_port))
        .await
        .map_err(|e| LaunchError::Proxy(format!("bind 127.0.0.1:{front_port}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| LaunchError::Proxy(format!("local addr: {e}")))?;

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "front proxy server error");
        }
    });

    tracing::info!(addr = %local_addr, "front proxy listening");
    Ok(FrontProxyHandle {
        spec,
        cancel,
        task,
        local_addr,
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn serve_spec(State(state): State<ProxyState>) -> axum::response::Response {
    let guard = state.spec.read().await;
    match guard.as_ref() {
        Some(bytes) => (
            [(header::CONTENT_TYPE, "application/json")],
            bytes.clone(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "spec not generated yet").into_response(),
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Reverse-proxy everything else to the gateway, streaming both bodies.
async fn forward(State(state): State<ProxyState>, request: Request) -> axum::response::Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.gateway_base, path_and_query);

    let mut outbound = state.client.request(parts.method.clone(), &url);
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || name == &header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    match outbound.send().await {
        Ok(upstream) => {
            let mut builder = Response::builder().status(upstream.status());
            for (name, value) in upstream.headers().iter() {
                if is_hop_by_hop(name) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            let stream = upstream.bytes_stream().map_err(io::Error::other);
            match builder.body(Body::from_stream(stream)) {
                Ok(response) => response.into_response(),
                Err(e) => (
                    StatusCode::BAD_GATEWAY,
                    format!("assemble proxied response: {e}"),
                )
                    .into_response(),
            }
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            format!("gateway unreachable: {e}"),
        )
            .into_response(),
    }
}
