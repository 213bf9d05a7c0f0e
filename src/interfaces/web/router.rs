use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{any, delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::{AppState, proxy};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_gateway_router(state: AppState) -> Router {
    // Webhooks authenticate via HMAC signatures, not the admin surface.
    let webhook_routes = Router::new()
        .route("/webhooks/{plugin}/{*path}", any(proxy::handle_webhook))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{name}", get(job_status))
        .route("/api/jobs/{name}/run", post(run_job))
        .route("/api/jobs/{name}/history", get(job_history))
        .route("/api/instances", get(list_instances))
        .route(
            "/api/instances/{org}/{plugin}/ensure",
            post(ensure_instance),
        )
        .route("/api/orgs/{org}/instances", delete(stop_org_instances))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.config.api_port))
        .with_state(state);

    webhook_routes.merge(api_routes)
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    let jobs = state.engine.job_statuses().await;
    Json(serde_json::json!({ "jobs": jobs })).into_response()
}

async fn job_status(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    match state.engine.job_status(&name).await {
        Ok(status) => Json(serde_json::json!({ "status": status })).into_response(),
        Err(e) => error_status(&e),
    }
}

async fn run_job(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    if let Err(e) = state.engine.run_job(&name).await {
        return error_status(&e);
    }
    match state.engine.job_status(&name).await {
        Ok(status) => {
            Json(serde_json::json!({ "success": true, "status": status })).into_response()
        }
        Err(e) => error_status(&e),
    }
}

async fn job_history(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    match state.store.recent_job_runs(&name, 50).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn list_instances(State(state): State<AppState>) -> Response {
    let stats = state.pool.pool_stats().await;
    Json(serde_json::json!({ "pool": stats })).into_response()
}

async fn ensure_instance(
    Path((org, plugin)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    if let Err(e) = state.pool.ensure_instance_running(&org, &plugin).await {
        return error_status(&e);
    }
    let port = state.pool.worker_port(&org, &plugin).await;
    Json(serde_json::json!({ "success": true, "port": port })).into_response()
}

async fn stop_org_instances(Path(org): Path<String>, State(state): State<AppState>) -> Response {
    let stopped = state.pool.stop_all_for_organization(&org).await;
    Json(serde_json::json!({ "success": true, "stopped": stopped })).into_response()
}

fn error_status(e: &crate::core::error::OrchestratorError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

async fn security_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'",
        ),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::core::pool::stub::StubSupervisor;
    use crate::core::pool::{InstanceKey, InstancePoolManager, ProcessSupervisor};
    use crate::core::scheduler::{JobDefinition, Schedule, SchedulerEngine};
    use crate::core::store::OrchestratorStore;
    use crate::interfaces::web::RateLimiter;
    use crate::worker::plugin;
    use axum::routing::post as post_route;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    struct TestGateway {
        state: AppState,
        supervisor: Arc<StubSupervisor>,
    }

    async fn gateway() -> TestGateway {
        gateway_with_limits(100).await
    }

    async fn gateway_with_limits(max_requests: u32) -> TestGateway {
        let supervisor = StubSupervisor::new();
        let store = Arc::new(OrchestratorStore::open_in_memory().unwrap());
        let config = Arc::new(OrchestratorConfig::default());
        let pool = InstancePoolManager::new(supervisor.clone(), store.clone(), config.clone());
        let engine = SchedulerEngine::new(Some(store.clone())).await.unwrap();
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        let state = AppState {
            engine,
            pool,
            store,
            config,
            manifests: Arc::new(plugin::builtin_manifests()),
            rate_limiter: RateLimiter::new(max_requests, 60),
            http: reqwest::Client::new(),
            log_tx,
        };
        TestGateway { state, supervisor }
    }

    async fn request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap_or(json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/jobs")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn jobs_can_be_listed_and_run_through_the_api() {
        let gateway = gateway().await;
        gateway
            .state
            .engine
            .register_job(
                JobDefinition::new(
                    "noop",
                    "Does nothing",
                    Schedule::IntervalMs(60_000),
                    Arc::new(|| Box::pin(async { Ok(()) })),
                )
                .disabled(),
            )
            .await
            .unwrap();

        let app = build_gateway_router(gateway.state.clone());
        let (status, json) = request(app, Method::GET, "/api/jobs", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["jobs"][0]["name"], "noop");

        let app = build_gateway_router(gateway.state.clone());
        let (status, json) = request(app, Method::POST, "/api/jobs/noop/run", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["status"]["total_runs"], 1);

        let app = build_gateway_router(gateway.state);
        let (status, json) = request(app, Method::GET, "/api/jobs/noop", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"]["name"], "noop");
    }

    #[tokio::test]
    async fn running_an_unknown_job_is_404() {
        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        let (status, _) = request(app, Method::POST, "/api/jobs/ghost/run", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ensure_endpoint_starts_a_worker() {
        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        let (status, json) = request(
            app,
            Method::POST,
            "/api/instances/org-1/echo/ensure",
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["port"], 18500);
        assert_eq!(gateway.supervisor.spawns(), 1);
    }

    #[tokio::test]
    async fn org_teardown_stops_all_its_workers() {
        let gateway = gateway().await;
        gateway
            .supervisor
            .insert_running(InstanceKey::new("org-1", "echo"), 18500)
            .await;
        gateway
            .supervisor
            .insert_running(InstanceKey::new("org-2", "echo"), 18501)
            .await;

        let app = build_gateway_router(gateway.state);
        let (status, json) =
            request(app, Method::DELETE, "/api/orgs/org-1/instances", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stopped"], 1);
        assert!(
            gateway
                .supervisor
                .is_running(&InstanceKey::new("org-2", "echo"))
                .await
        );
    }

    // === Webhook proxy ===

    #[tokio::test]
    async fn webhook_for_unknown_plugin_is_404() {
        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        let (status, _) = request(
            app,
            Method::POST,
            "/webhooks/ghost/events?org=org-1",
            Some(json!({})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_requires_an_organization() {
        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        let (status, json) = request(
            app,
            Method::POST,
            "/webhooks/echo/ping",
            Some(json!({})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("organization"));
    }

    #[tokio::test]
    async fn webhook_without_enabled_instance_is_404() {
        let gateway = gateway().await;
        gateway
            .state
            .store
            .upsert_instance("echo", "org-1", false, &json!({}))
            .await
            .unwrap();
        let app = build_gateway_router(gateway.state);
        let (status, _) = request(
            app,
            Method::POST,
            "/webhooks/echo/ping?org=org-1",
            Some(json!({})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_rate_limit_returns_429() {
        let gateway = gateway_with_limits(1).await;
        let app = build_gateway_router(gateway.state.clone());
        let (first, _) = request(
            app,
            Method::POST,
            "/webhooks/echo/ping?org=org-1",
            Some(json!({})),
            &[],
        )
        .await;
        // First request passed the limiter (and failed later on instance
        // lookup); the second is cut off at the limiter.
        assert_eq!(first, StatusCode::NOT_FOUND);

        let app = build_gateway_router(gateway.state);
        let (second, json) = request(
            app,
            Method::POST,
            "/webhooks/echo/ping?org=org-1",
            Some(json!({})),
            &[],
        )
        .await;
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        // The body carries the taxonomy message naming the plugin.
        assert!(json["error"].as_str().unwrap().contains("echo"));
    }

    #[tokio::test]
    async fn signed_webhook_rejects_a_bad_signature() {
        let gateway = gateway().await;
        gateway
            .state
            .store
            .upsert_instance("echo", "org-1", true, &json!({}))
            .await
            .unwrap();
        gateway
            .state
            .store
            .set_secret("org-1", "ECHO_WEBHOOK_SECRET", "gh_secret")
            .await
            .unwrap();

        let app = build_gateway_router(gateway.state);
        let (status, json) = request(
            app,
            Method::POST,
            "/webhooks/echo/events?org=org-1",
            Some(json!({"action": "opened"})),
            &[("x-hub-signature-256", "sha256=deadbeef")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "signature verification failed");
    }

    #[tokio::test]
    async fn signed_webhook_without_configured_secret_is_401() {
        let gateway = gateway().await;
        gateway
            .state
            .store
            .upsert_instance("echo", "org-1", true, &json!({}))
            .await
            .unwrap();

        let app = build_gateway_router(gateway.state);
        let (status, _) = request(
            app,
            Method::POST,
            "/webhooks/echo/events?org=org-1",
            Some(json!({})),
            &[("x-hub-signature-256", "sha256=deadbeef")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn verified_webhook_is_forwarded_to_the_worker() {
        // Stand-in worker answering on its route surface.
        let worker_app = Router::new().route(
            "/routes/ping",
            post_route(|body: String| async move {
                Json(json!({ "received": body }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, worker_app).await.unwrap();
        });

        let gateway = gateway().await;
        gateway
            .state
            .store
            .upsert_instance("echo", "org-1", true, &json!({}))
            .await
            .unwrap();
        gateway
            .supervisor
            .insert_running(InstanceKey::new("org-1", "echo"), port)
            .await;

        let app = build_gateway_router(gateway.state);
        let (status, json) = request(
            app,
            Method::POST,
            "/webhooks/echo/ping?org=org-1",
            Some(json!({"hello": 1})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["received"].as_str().unwrap().contains("hello"));
        // No spawn happened; the worker was already running.
        assert_eq!(gateway.supervisor.spawns(), 0);
    }

    #[tokio::test]
    async fn gateway_route_contract() {
        let paths: HashMap<&str, Method> = [
            ("/api/jobs", Method::GET),
            ("/api/jobs/x", Method::GET),
            ("/api/jobs/x/run", Method::POST),
            ("/api/jobs/x/history", Method::GET),
            ("/api/instances", Method::GET),
            ("/api/orgs/org-1/instances", Method::DELETE),
        ]
        .into_iter()
        .collect();

        let gateway = gateway().await;
        let app = build_gateway_router(gateway.state);
        for (path, method) in paths {
            let req = Request::builder()
                .method(method)
                .uri(path)
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_ne!(
                resp.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "Wrong method for {}",
                path
            );
        }
    }
}
