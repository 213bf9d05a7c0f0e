//! Worker process runner: one plugin for one organization, driven through
//! a fixed state machine. Failures before the HTTP server starts are
//! fatal; failures after it leave the worker serving in degraded mode so
//! health and metadata probes stay reachable.

pub mod http;
pub mod plugin;

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::mcp::{LocalServerContext, ToolRouter};
use plugin::{Plugin, PluginContext};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_BIND_FAILED: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Bootstrapping,
    Loaded,
    GloballyInitialized,
    Serving,
    OrgInitialized,
    ShuttingDown,
    Terminated,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Bootstrapping => "bootstrapping",
            WorkerState::Loaded => "loaded",
            WorkerState::GloballyInitialized => "globally_initialized",
            WorkerState::Serving => "serving",
            WorkerState::OrgInitialized => "org_initialized",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub organization_id: String,
    pub plugin_id: String,
    pub port: u16,
    pub test_mode: bool,
}

/// Per-organization runtime data loaded after the HTTP server is up.
#[derive(Clone)]
pub struct OrgRuntime {
    pub organization_id: String,
    pub config: Value,
    pub auth: Value,
}

pub struct WorkerRuntime {
    pub args: WorkerArgs,
    pub plugin: Plugin,
    pub capabilities: Arc<plugin::CapabilityRegistry>,
    pub tools: Arc<ToolRouter>,
    pub org: Mutex<Option<OrgRuntime>>,
    pub state: Mutex<WorkerState>,
    pub started_at: Instant,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
}

impl WorkerRuntime {
    pub async fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().await;
        info!(
            "Worker {}/{}: {} -> {}",
            self.args.organization_id,
            self.args.plugin_id,
            state.as_str(),
            next.as_str()
        );
        *state = next;
    }

    pub async fn current_state(&self) -> WorkerState {
        *self.state.lock().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Idempotent: a second invocation while already shutting down is a
    /// logged no-op.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress, ignoring");
            return Ok(());
        }
        self.set_state(WorkerState::ShuttingDown).await;

        let mut shutdown_error = None;
        let org = self.org.lock().await.clone();
        if let (Some(org), Some(on_disable)) = (org, self.plugin.hooks.on_disable.clone()) {
            let context = PluginContext {
                organization_id: org.organization_id,
                config: org.config,
                auth: org.auth,
                tools: self.tools.clone(),
            };
            if let Err(e) = on_disable(context).await {
                error!("Disable hook failed during shutdown: {}", e);
                shutdown_error = Some(e);
            }
        }
        self.tools.stop_all().await;
        self.shutdown_token.cancel();

        self.set_state(WorkerState::Terminated).await;
        match shutdown_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run the worker to completion and return the process exit code.
pub async fn run(args: WorkerArgs) -> i32 {
    // Bootstrapping -> Loaded: resolve and validate the plugin.
    let plugin = match plugin::load_plugin(&args.plugin_id) {
        Ok(plugin) => plugin,
        Err(e) => {
            error!("Failed to load plugin '{}': {}", args.plugin_id, e);
            return EXIT_FATAL;
        }
    };

    let capabilities = plugin::CapabilityRegistry::new();
    let (tools, mut tool_events) = ToolRouter::new(LocalServerContext::default());
    tokio::spawn(async move {
        while let Some(event) = tool_events.recv().await {
            info!("MCP server '{}' registered ({})", event.server_id, event.kind);
        }
    });

    let runtime = Arc::new(WorkerRuntime {
        args: args.clone(),
        plugin,
        capabilities,
        tools,
        org: Mutex::new(None),
        state: Mutex::new(WorkerState::Loaded),
        started_at: Instant::now(),
        shutting_down: AtomicBool::new(false),
        shutdown_token: CancellationToken::new(),
    });

    // Loaded -> GloballyInitialized: global registration side effects
    // only, no per-organization I/O.
    if let Some(on_initialize) = runtime.plugin.hooks.on_initialize.clone() {
        if let Err(e) = on_initialize(runtime.capabilities.clone()).await {
            error!("Global initialization failed: {}", e);
            return EXIT_FATAL;
        }
    }
    runtime.set_state(WorkerState::GloballyInitialized).await;

    // GloballyInitialized -> Serving: bind the local HTTP surface.
    let addr = format!("127.0.0.1:{}", args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind worker port {}: {}", addr, e);
            return EXIT_BIND_FAILED;
        }
    };
    info!("Worker HTTP surface on http://{}", addr);

    let app = http::build_worker_router(runtime.clone());
    let server_token = runtime.shutdown_token.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
        {
            error!("Worker HTTP server crashed: {}", e);
        }
    });
    runtime.set_state(WorkerState::Serving).await;

    // Serving -> OrgInitialized: non-fatal past this point. The HTTP
    // surface stays reachable even if org runtime setup fails.
    match initialize_org_runtime(&runtime).await {
        Ok(()) => runtime.set_state(WorkerState::OrgInitialized).await,
        Err(e) => warn!(
            "Org runtime initialization failed, serving in degraded mode: {}",
            e
        ),
    }

    wait_for_termination_signal().await;
    let exit = match runtime.shutdown().await {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_FATAL,
    };
    let _ = server.await;
    exit
}

async fn initialize_org_runtime(runtime: &Arc<WorkerRuntime>) -> anyhow::Result<()> {
    let org = load_org_runtime(&runtime.args)?;
    *runtime.org.lock().await = Some(org.clone());

    // Manifest-declared subprocess tool servers come up before the start
    // hook so the hook can already call their tools.
    for spec in &runtime.plugin.manifest.tool_servers {
        runtime
            .tools
            .register_local(
                &spec.id,
                crate::core::mcp::local::stdio_initializer(
                    spec.id.clone(),
                    spec.command.clone(),
                    spec.args.clone(),
                    spec.env.clone(),
                ),
            )
            .await?;
    }

    if let Some(on_start) = runtime.plugin.hooks.on_start.clone() {
        let context = PluginContext {
            organization_id: org.organization_id,
            config: org.config,
            auth: org.auth,
            tools: runtime.tools.clone(),
        };
        on_start(context).await?;
    }
    Ok(())
}

/// Org runtime data comes from the environment in production; tests run
/// against a fixed mock organization.
fn load_org_runtime(args: &WorkerArgs) -> anyhow::Result<OrgRuntime> {
    if args.test_mode {
        return Ok(OrgRuntime {
            organization_id: args.organization_id.clone(),
            config: serde_json::json!({}),
            auth: serde_json::json!({}),
        });
    }
    let config = match std::env::var("PLUGDOCK_ORG_CONFIG") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => serde_json::json!({}),
    };
    let auth = match std::env::var("PLUGDOCK_ORG_AUTH") {
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(_) => serde_json::json!({}),
    };
    Ok(OrgRuntime {
        organization_id: args.organization_id.clone(),
        config,
        auth,
    })
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("Received interrupt"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt");
}
