//! Gateway HTTP interface: the admin API over the scheduler and pool,
//! the inbound webhook proxy and the live log stream.

mod proxy;
mod ratelimit;
mod router;

use anyhow::Result;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::core::pool::InstancePoolManager;
use crate::core::scheduler::SchedulerEngine;
use crate::core::store::OrchestratorStore;
use crate::worker::plugin::PluginManifest;

pub use ratelimit::RateLimiter;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: SchedulerEngine,
    pub(crate) pool: Arc<InstancePoolManager>,
    pub(crate) store: Arc<OrchestratorStore>,
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) manifests: Arc<HashMap<String, PluginManifest>>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) http: reqwest::Client,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
}

pub struct GatewayServer {
    pub engine: SchedulerEngine,
    pub pool: Arc<InstancePoolManager>,
    pub store: Arc<OrchestratorStore>,
    pub config: Arc<OrchestratorConfig>,
    pub manifests: HashMap<String, PluginManifest>,
    pub rate_limiter: Arc<RateLimiter>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
}

impl GatewayServer {
    /// Bind and serve in a background task; fails fast if the port is
    /// taken.
    pub async fn start(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.api_host, self.config.api_port);
        let state = AppState {
            engine: self.engine,
            pool: self.pool,
            store: self.store,
            config: self.config,
            manifests: Arc::new(self.manifests),
            rate_limiter: self.rate_limiter,
            http: reqwest::Client::new(),
            log_tx: self.log_tx,
        };
        let app = router::build_gateway_router(state);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Gateway API running at http://{}", addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Gateway API crashed: {}", e);
            }
        });
        Ok(())
    }
}

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Sse::new(stream)
}
