//! The worker's local HTTP surface. Everything the orchestrator knows
//! about a running worker goes through these endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use super::{WorkerRuntime, plugin};

pub fn build_worker_router(runtime: Arc<WorkerRuntime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/validate-auth", post(validate_auth))
        .route("/config-update", post(config_update))
        .route("/disable", post(disable))
        .route("/mcp/call-tool", post(call_tool))
        .route("/mcp/list-tools", get(list_tools))
        .route("/routes/{*path}", any(dispatch_route))
        .with_state(runtime)
}

async fn health(State(runtime): State<Arc<WorkerRuntime>>) -> Response {
    if runtime.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "error": "shutting down" })),
        )
            .into_response();
    }
    let org_id = runtime
        .org
        .lock()
        .await
        .as_ref()
        .map(|org| org.organization_id.clone());
    Json(json!({
        "status": "healthy",
        "uptime": runtime.started_at.elapsed().as_secs(),
        "pid": std::process::id(),
        "orgId": org_id,
        "mcpServers": runtime.tools.server_ids().await,
        "memory": resident_memory_bytes(),
    }))
    .into_response()
}

async fn metadata(State(runtime): State<Arc<WorkerRuntime>>) -> Response {
    let mut descriptor = runtime.capabilities.descriptor().await;
    let (local, external) = runtime.tools.servers_by_kind().await;
    descriptor["mcp"] = json!({ "local": local, "external": external });
    Json(descriptor).into_response()
}

async fn validate_auth(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(body): Json<Value>,
) -> Response {
    let Some(auth_state) = body.get("authState").cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "error": "authState is required" })),
        )
            .into_response();
    };
    let auth: plugin::AuthState = match serde_json::from_value(auth_state) {
        Ok(auth) => auth,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "valid": false, "error": format!("malformed authState: {}", e) })),
            )
                .into_response();
        }
    };

    // A plugin without auth requirements accepts any credentials.
    let Some(hook) = runtime.plugin.hooks.on_validate_auth.clone() else {
        return Json(json!({ "valid": true })).into_response();
    };
    match hook(auth).await {
        Ok(valid) => Json(json!({ "valid": valid })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "valid": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn config_update(
    State(runtime): State<Arc<WorkerRuntime>>,
    Json(body): Json<Value>,
) -> Response {
    let Some(config) = body.get("config").cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "config is required" })),
        )
            .into_response();
    };

    if let Some(hook) = runtime.plugin.hooks.on_config_update.clone() {
        if let Err(e) = hook(config.clone()).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    }
    if let Some(org) = runtime.org.lock().await.as_mut() {
        org.config = config;
    }
    Json(json!({ "success": true })).into_response()
}

async fn disable(State(runtime): State<Arc<WorkerRuntime>>) -> Response {
    let org = runtime.org.lock().await.clone();
    if let (Some(org), Some(hook)) = (org, runtime.plugin.hooks.on_disable.clone()) {
        let context = plugin::PluginContext {
            organization_id: org.organization_id,
            config: org.config,
            auth: org.auth,
            tools: runtime.tools.clone(),
        };
        if let Err(e) = hook(context).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    }
    runtime.tools.stop_all().await;
    Json(json!({ "success": true })).into_response()
}

async fn call_tool(State(runtime): State<Arc<WorkerRuntime>>, Json(body): Json<Value>) -> Response {
    let Some(tool_name) = body.get("toolName").and_then(|n| n.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "toolName is required" })),
        )
            .into_response();
    };
    let arguments = body.get("arguments").cloned().unwrap_or(json!({}));

    match runtime.tools.call_tool(tool_name, arguments).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn list_tools(State(runtime): State<Arc<WorkerRuntime>>) -> Response {
    let tools = runtime.tools.list_tools().await;
    Json(json!({ "tools": tools })).into_response()
}

async fn dispatch_route(
    State(runtime): State<Arc<WorkerRuntime>>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(handler) = runtime.capabilities.route(method.as_str(), &path).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no route {} /{}", method, path) })),
        )
            .into_response();
    };

    let request = plugin::RouteRequest {
        method: method.to_string(),
        path,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        query,
        body,
    };

    match handler(request).await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
            let mut out = (status, Json(response.body)).into_response();
            for (name, value) in response.headers {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::from_bytes(name.as_bytes()),
                    axum::http::HeaderValue::from_str(&value),
                ) {
                    out.headers_mut().insert(name, value);
                }
            }
            out
        }
        Err(e) => {
            error!("Route handler failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Resident set size from procfs; absent on platforms without it.
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mcp::{LocalServerContext, ToolRouter};
    use crate::worker::{OrgRuntime, WorkerArgs, WorkerState, initialize_org_runtime};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn runtime_with_plugin(plugin: plugin::Plugin) -> Arc<WorkerRuntime> {
        let (tools, _events) = ToolRouter::new(LocalServerContext::default());
        Arc::new(WorkerRuntime {
            args: WorkerArgs {
                organization_id: "org-1".to_string(),
                plugin_id: plugin.manifest.name.clone(),
                port: 0,
                test_mode: true,
            },
            plugin,
            capabilities: plugin::CapabilityRegistry::new(),
            tools,
            org: Mutex::new(Some(OrgRuntime {
                organization_id: "org-1".to_string(),
                config: json!({}),
                auth: json!({}),
            })),
            state: Mutex::new(WorkerState::Serving),
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        })
    }

    async fn echo_runtime() -> Arc<WorkerRuntime> {
        let runtime = runtime_with_plugin(plugin::load_plugin("echo").unwrap());
        if let Some(init) = runtime.plugin.hooks.on_initialize.clone() {
            init(runtime.capabilities.clone()).await.unwrap();
        }
        initialize_org_runtime(&runtime).await.unwrap();
        runtime
    }

    async fn request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_org_and_mcp_servers() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) = request(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["orgId"], "org-1");
        assert_eq!(json["mcpServers"][0], "echo");
    }

    #[tokio::test]
    async fn health_is_unhealthy_while_shutting_down() {
        let runtime = echo_runtime().await;
        runtime.shutdown().await.unwrap();
        let app = build_worker_router(runtime);
        let (status, json) = request(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metadata_describes_capabilities() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) = request(app, Method::GET, "/metadata", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["configSchema"]["properties"]["greeting"].is_object());
        assert_eq!(json["authMethods"][0]["id"], "api-key");
        assert_eq!(json["routes"].as_array().unwrap().len(), 2);
        assert_eq!(json["mcp"]["local"][0], "echo");
        assert!(json["mcp"]["external"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn validate_auth_requires_auth_state() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) =
            request(app, Method::POST, "/validate-auth", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["valid"], false);
    }

    #[tokio::test]
    async fn validate_auth_runs_the_plugin_hook() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime.clone());
        let (status, json) = request(
            app,
            Method::POST,
            "/validate-auth",
            Some(json!({
                "authState": { "methodId": "api-key", "credentials": { "apiKey": "k-123" } }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["valid"], true);

        let app = build_worker_router(runtime);
        let (status, json) = request(
            app,
            Method::POST,
            "/validate-auth",
            Some(json!({
                "authState": { "methodId": "oauth", "credentials": {} }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["valid"], false);
    }

    #[tokio::test]
    async fn config_update_requires_config_field_and_stores_it() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime.clone());
        let (status, _) = request(app, Method::POST, "/config-update", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let app = build_worker_router(runtime.clone());
        let (status, json) = request(
            app,
            Method::POST,
            "/config-update",
            Some(json!({ "config": { "greeting": "hello" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        let org = runtime.org.lock().await;
        assert_eq!(org.as_ref().unwrap().config["greeting"], "hello");
    }

    #[tokio::test]
    async fn disable_stops_mcp_servers() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime.clone());
        let (status, json) = request(app, Method::POST, "/disable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert!(runtime.tools.server_ids().await.is_empty());
    }

    #[tokio::test]
    async fn call_tool_round_trips_through_the_router() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) = request(
            app,
            Method::POST,
            "/mcp/call-tool",
            Some(json!({ "toolName": "echo", "arguments": { "q": 1 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["echo"]["q"], 1);
    }

    #[tokio::test]
    async fn call_tool_maps_unknown_tool_to_404() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) = request(
            app,
            Method::POST,
            "/mcp/call-tool",
            Some(json!({ "toolName": "missing" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn call_tool_requires_tool_name() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, _) = request(app, Method::POST, "/mcp/call-tool", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_tools_tags_tools_with_server_ids() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime);
        let (status, json) = request(app, Method::GET, "/mcp/list-tools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tools"][0]["name"], "echo");
        assert_eq!(json["tools"][0]["serverId"], "echo");
    }

    #[tokio::test]
    async fn plugin_routes_dispatch_by_method_and_path() {
        let runtime = echo_runtime().await;
        let app = build_worker_router(runtime.clone());
        let (status, json) = request(
            app,
            Method::POST,
            "/routes/ping",
            Some(json!({ "hello": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["path"], "ping");

        let app = build_worker_router(runtime);
        let (status, _) = request(app, Method::GET, "/routes/ping", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn route_handler_error_is_a_500_with_body() {
        let failing: plugin::RouteHandler = Arc::new(|_request| {
            Box::pin(async move { anyhow::bail!("boom") })
        });
        let runtime = runtime_with_plugin(plugin::load_plugin("echo").unwrap());
        runtime
            .capabilities
            .register_route("GET", "broken", failing)
            .await;

        let app = build_worker_router(runtime);
        let (status, json) = request(app, Method::GET, "/routes/broken", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("boom"));
    }
}
