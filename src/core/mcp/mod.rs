//! MCP tool routing for one worker: a registry of local (in-process or
//! subprocess-backed) and remote (HTTP JSON-RPC) tool servers, tool
//! listing aggregation and call dispatch through an explicit
//! tool-name index.

pub mod local;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::core::error::OrchestratorError;

pub use remote::RemoteServerOptions;

const REMOTE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A tool as surfaced to callers, tagged with its owning server.
#[derive(Serialize, Debug, Clone)]
pub struct RoutedTool {
    #[serde(flatten)]
    pub tool: McpTool,
    #[serde(rename = "serverId")]
    pub server_id: String,
}

/// What a local tool server must expose. Subprocess-backed servers
/// implement this over stdio JSON-RPC; plugins may also hand the router a
/// plain in-process implementation.
#[async_trait]
pub trait ToolServerHandle: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Capabilities handed to a local server initializer.
#[derive(Debug, Clone, Default)]
pub struct LocalServerContext {
    pub config: Value,
    pub auth: Value,
}

pub type LocalInitializer = Box<
    dyn FnOnce(
            LocalServerContext,
        ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ToolServerHandle>>> + Send>>
        + Send,
>;

#[derive(Debug, Clone, Serialize)]
pub struct ToolRouterEvent {
    pub server_id: String,
    pub kind: &'static str,
}

enum RegisteredServer {
    Local(Arc<dyn ToolServerHandle>),
    Remote(remote::RemoteToolServer),
}

pub struct ToolRouter {
    servers: Mutex<HashMap<String, RegisteredServer>>,
    /// Explicit tool-name → server-id index, built at registration time
    /// and refreshed by every successful listing.
    tool_index: Mutex<HashMap<String, String>>,
    events: mpsc::Sender<ToolRouterEvent>,
    http: reqwest::Client,
    context: LocalServerContext,
    remote_timeout: Duration,
}

impl ToolRouter {
    /// Returns the router and the event stream the platform watches to
    /// learn when servers come up. The channel is bounded; a full buffer
    /// drops the notification with a warning rather than blocking routing.
    pub fn new(context: LocalServerContext) -> (Arc<Self>, mpsc::Receiver<ToolRouterEvent>) {
        let (events, rx) = mpsc::channel(32);
        (
            Arc::new(Self {
                servers: Mutex::new(HashMap::new()),
                tool_index: Mutex::new(HashMap::new()),
                events,
                http: reqwest::Client::new(),
                context,
                remote_timeout: REMOTE_RPC_TIMEOUT,
            }),
            rx,
        )
    }

    #[cfg(test)]
    fn with_remote_timeout(mut router: Arc<Self>, timeout: Duration) -> Arc<Self> {
        Arc::get_mut(&mut router)
            .expect("router not yet shared")
            .remote_timeout = timeout;
        router
    }

    pub async fn register_local(
        &self,
        id: &str,
        initializer: LocalInitializer,
    ) -> Result<(), OrchestratorError> {
        {
            let servers = self.servers.lock().await;
            if servers.contains_key(id) {
                return Err(OrchestratorError::Duplicate(format!(
                    "mcp server '{}' is already registered",
                    id
                )));
            }
        }

        let handle = initializer(self.context.clone())
            .await
            .map_err(|e| OrchestratorError::StartFailed(format!("mcp server '{}': {}", id, e)))?;

        // Index the server's tools up front so call routing never relies
        // on a linear first-match scan.
        match handle.list_tools().await {
            Ok(tools) => {
                let mut index = self.tool_index.lock().await;
                for tool in tools {
                    index.insert(tool.name, id.to_string());
                }
            }
            Err(e) => warn!("Could not index tools for mcp server '{}': {}", id, e),
        }

        self.servers
            .lock()
            .await
            .insert(id.to_string(), RegisteredServer::Local(handle));
        self.notify(id, "local");
        info!("Registered local mcp server '{}'", id);
        Ok(())
    }

    /// Stores the endpoint without any connectivity check; a dead remote
    /// only surfaces as omitted tools later.
    pub async fn register_remote(
        &self,
        options: RemoteServerOptions,
    ) -> Result<(), OrchestratorError> {
        let mut servers = self.servers.lock().await;
        if servers.contains_key(&options.id) {
            return Err(OrchestratorError::Duplicate(format!(
                "mcp server '{}' is already registered",
                options.id
            )));
        }
        let id = options.id.clone();
        servers.insert(
            id.clone(),
            RegisteredServer::Remote(remote::RemoteToolServer::new(options)),
        );
        drop(servers);
        self.notify(&id, "remote");
        info!("Registered remote mcp server '{}'", id);
        Ok(())
    }

    /// Aggregate tools across every registered server. A failing server's
    /// contribution is logged and omitted; the rest proceed.
    pub async fn list_tools(&self) -> Vec<RoutedTool> {
        let snapshot: Vec<(String, ServerRef)> = self.snapshot().await;
        let mut aggregated = Vec::new();
        for (id, server) in snapshot {
            let listed = match server {
                ServerRef::Local(handle) => handle.list_tools().await,
                ServerRef::Remote(remote) => {
                    remote
                        .list_tools(&self.http, self.remote_timeout)
                        .await
                        .map_err(|e| anyhow::anyhow!(e.to_string()))
                }
            };
            match listed {
                Ok(tools) => {
                    let mut index = self.tool_index.lock().await;
                    for tool in tools {
                        index.insert(tool.name.clone(), id.clone());
                        aggregated.push(RoutedTool {
                            tool,
                            server_id: id.clone(),
                        });
                    }
                }
                Err(e) => warn!("Omitting tools from mcp server '{}': {}", id, e),
            }
        }
        aggregated
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, OrchestratorError> {
        // The index guard must drop before the refresh path locks it again.
        let cached = self.tool_index.lock().await.get(name).cloned();
        let server_id = match cached {
            Some(id) => id,
            None => {
                // One lazy refresh before giving up; the tool may belong to
                // a remote that has not been listed yet.
                self.list_tools().await;
                self.tool_index
                    .lock()
                    .await
                    .get(name)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::NotFound(format!("tool '{}'", name)))?
            }
        };

        let server = {
            let servers = self.servers.lock().await;
            match servers.get(&server_id) {
                Some(RegisteredServer::Local(handle)) => ServerRef::Local(handle.clone()),
                Some(RegisteredServer::Remote(remote)) => ServerRef::Remote(remote.clone()),
                None => {
                    return Err(OrchestratorError::NotFound(format!(
                        "mcp server '{}'",
                        server_id
                    )));
                }
            }
        };

        match server {
            ServerRef::Local(handle) => handle
                .call_tool(name, arguments)
                .await
                .map_err(|e| OrchestratorError::Execution(e.to_string())),
            ServerRef::Remote(remote) => {
                remote
                    .call_tool(&self.http, self.remote_timeout, name, arguments)
                    .await
            }
        }
    }

    /// Stop every local server in parallel, swallowing individual
    /// failures, then clear the registry.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, Arc<dyn ToolServerHandle>)> = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .filter_map(|(id, server)| match server {
                    RegisteredServer::Local(handle) => Some((id.clone(), handle.clone())),
                    RegisteredServer::Remote(_) => None,
                })
                .collect()
        };

        let mut stops = Vec::new();
        for (id, handle) in handles {
            stops.push(tokio::spawn(async move {
                if let Err(e) = handle.stop().await {
                    warn!("Failed to stop mcp server '{}': {}", id, e);
                }
            }));
        }
        for stop in stops {
            let _ = stop.await;
        }

        self.servers.lock().await.clear();
        self.tool_index.lock().await.clear();
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registered server ids split into (local, remote).
    pub async fn servers_by_kind(&self) -> (Vec<String>, Vec<String>) {
        let servers = self.servers.lock().await;
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for (id, server) in servers.iter() {
            match server {
                RegisteredServer::Local(_) => local.push(id.clone()),
                RegisteredServer::Remote(_) => remote.push(id.clone()),
            }
        }
        local.sort();
        remote.sort();
        (local, remote)
    }

    async fn snapshot(&self) -> Vec<(String, ServerRef)> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|(id, server)| {
                let server = match server {
                    RegisteredServer::Local(handle) => ServerRef::Local(handle.clone()),
                    RegisteredServer::Remote(remote) => ServerRef::Remote(remote.clone()),
                };
                (id.clone(), server)
            })
            .collect()
    }

    fn notify(&self, id: &str, kind: &'static str) {
        let event = ToolRouterEvent {
            server_id: id.to_string(),
            kind,
        };
        if self.events.try_send(event).is_err() {
            warn!("Tool router event buffer full, dropping notification for '{}'", id);
        }
    }
}

enum ServerRef {
    Local(Arc<dyn ToolServerHandle>),
    Remote(remote::RemoteToolServer),
}
