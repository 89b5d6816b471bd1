//! End-to-end merge pipeline against a stand-in gateway: per-tool OpenAPI
//! fetch (with API-key enforcement), overlay filtering, and serving the
//! merged document through the front proxy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use serde_json::{Value, json};

use mcp_launch::instance::{Instance, InstanceDiagnostics};
use mcp_launch::overlay::{CompositeOverlay, NestedOverlay, ServerSelection};
use mcp_launch::{LaunchError, StackConfig, TunnelMode, merge_instance, start_front_proxy};

const TEST_KEY: &str = "k0000000000000000000000000000000000000001";

#[derive(Clone)]
struct GatewayState {
    specs: BTreeMap<String, Value>,
}

async fn serve_tool_spec(
    State(state): State<GatewayState>,
    axum::extract::Path(server): axum::extract::Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, (StatusCode, String)> {
    let key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if key != TEST_KEY {
        return Err((StatusCode::FORBIDDEN, "bad api key".to_string()));
    }
    match state.specs.get(&server) {
        Some(spec) => Ok(Json(spec.clone())),
        None => Err((StatusCode::NOT_FOUND, format!("no server {server}"))),
    }
}

/// Serve `/{server}/openapi.json` for the given per-server documents and
/// return the bound port.
async fn fake_gateway(specs: BTreeMap<String, Value>) -> u16 {
    let app = Router::new()
        .route("/{server}/openapi.json", get(serve_tool_spec))
        .with_state(GatewayState { specs });
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn fs_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "paths": {
            "/read_file": {
                "post": {
                    "operationId": "read_file_post",
                    "description": "Read a file",
                    "responses": {"200": {"description": "OK"}}
                }
            },
            "/dangerous": {
                "post": {"responses": {"200": {"description": "OK"}}}
            }
        }
    })
}

fn web_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "paths": {
            "/search": {
                "post": {
                    "operationId": "search_post",
                    "responses": {"200": {"description": "OK"}}
                }
            }
        }
    })
}

fn make_instance(name: &str, gateway_port: u16) -> Instance {
    Instance {
        name: name.to_string(),
        config_path: PathBuf::from(format!("{name}.json")),
        front_port: 0,
        gateway_port,
        api_key: TEST_KEY.to_string(),
        public_url: None,
        tunnel_mode: TunnelMode::None,
        tunnel_name: None,
        gateway_pid: None,
        tunnel_pid: None,
        tool_names: vec![],
        started_at_unix: 0,
        diagnostics: InstanceDiagnostics::default(),
    }
}

fn config_with(servers: &[&str]) -> StackConfig {
    let mut config = StackConfig::default();
    for server in servers {
        config.mcp_servers.insert(
            server.to_string(),
            mcp_launch::ServerDefinition {
                command: Some("echo".to_string()),
                ..Default::default()
            },
        );
    }
    config
}

#[tokio::test]
async fn merge_fetches_filters_and_serves_through_front_proxy() {
    let specs: BTreeMap<String, Value> = [
        ("fs".to_string(), fs_spec()),
        ("web".to_string(), web_spec()),
    ]
    .into_iter()
    .collect();
    let gateway_port = fake_gateway(specs).await;

    let instance = make_instance("alpha", gateway_port);
    let config = config_with(&["fs", "web"]);

    // Deny one tool on fs; leave web untouched.
    let mut composite = CompositeOverlay::default();
    composite.servers.insert(
        "alpha/fs".to_string(),
        ServerSelection {
            deny: ["dangerous".to_string()].into_iter().collect(),
            ..Default::default()
        },
    );
    let overlay = NestedOverlay::from_composite(&composite, &["alpha".to_string()]);

    let outcome = merge_instance(&instance, &config, &overlay, "https://pub.example.com")
        .await
        .unwrap();

    let doc: Value = serde_json::from_slice(&outcome.bytes).unwrap();
    assert_eq!(doc["servers"][0]["url"], "https://pub.example.com");
    assert!(doc["paths"].get("/fs/read_file").is_some());
    assert!(doc["paths"].get("/fs/dangerous").is_none());
    assert!(doc["paths"].get("/web/search").is_some());
    assert_eq!(
        doc["paths"]["/web/search"]["post"]["operationId"],
        "web__search_post"
    );
    assert_eq!(outcome.diagnostics.operation_count, 2);
    assert!(outcome.dangling_refs.is_empty());

    // Install into a front proxy and read it back over HTTP.
    let proxy = start_front_proxy(0, gateway_port).await.unwrap();
    proxy.install_spec(outcome.bytes.clone()).await;

    let url = format!("http://{}/openapi.json", proxy.local_addr);
    let served: Value = serde_json::from_str(
        &reqwest::get(&url).await.unwrap().text().await.unwrap(),
    )
    .unwrap();
    assert_eq!(served, doc);

    proxy.close(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn merge_skips_disabled_server_entirely() {
    let specs: BTreeMap<String, Value> = [
        ("fs".to_string(), fs_spec()),
        ("web".to_string(), web_spec()),
    ]
    .into_iter()
    .collect();
    let gateway_port = fake_gateway(specs).await;

    let instance = make_instance("alpha", gateway_port);
    let config = config_with(&["fs", "web"]);

    let mut composite = CompositeOverlay::default();
    composite.servers.insert(
        "alpha/web".to_string(),
        ServerSelection {
            disabled: true,
            ..Default::default()
        },
    );
    let overlay = NestedOverlay::from_composite(&composite, &["alpha".to_string()]);

    let outcome = merge_instance(&instance, &config, &overlay, "http://local")
        .await
        .unwrap();
    let doc: Value = serde_json::from_slice(&outcome.bytes).unwrap();
    assert!(doc["paths"].get("/web/search").is_none());
    assert!(doc["paths"].get("/fs/read_file").is_some());
}

#[tokio::test]
async fn merge_fails_with_body_on_bad_api_key() {
    let specs: BTreeMap<String, Value> = [("fs".to_string(), fs_spec())].into_iter().collect();
    let gateway_port = fake_gateway(specs).await;

    let mut instance = make_instance("alpha", gateway_port);
    instance.api_key = "wrong".to_string();
    let config = config_with(&["fs"]);
    let overlay = NestedOverlay::from_composite(&CompositeOverlay::default(), &["alpha".to_string()]);

    let result = merge_instance(&instance, &config, &overlay, "http://local").await;
    match result {
        Err(LaunchError::Fetch(url, detail)) => {
            assert!(url.contains("/fs/openapi.json"));
            assert!(detail.contains("403"));
            assert!(detail.contains("bad api key"));
        }
        other => panic!("expected fetch error, got {other:?}"),
    }
}

#[tokio::test]
async fn merge_fails_on_missing_server_spec() {
    let gateway_port = fake_gateway(BTreeMap::new()).await;
    let instance = make_instance("alpha", gateway_port);
    let config = config_with(&["ghost"]);
    let overlay = NestedOverlay::from_composite(&CompositeOverlay::default(), &["alpha".to_string()]);

    let result = merge_instance(&instance, &config, &overlay, "http://local").await;
    assert!(matches!(result, Err(LaunchError::Fetch(_, _))));
}
