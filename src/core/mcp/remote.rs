use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{JsonRpcRequest, JsonRpcResponse, McpTool};
use crate::core::error::OrchestratorError;

#[derive(Debug, Clone)]
pub struct RemoteServerOptions {
    pub id: String,
    pub url: String,
    pub auth_headers: HashMap<String, String>,
}

/// JSON-RPC 2.0 over HTTP POST: `tools/list` and `tools/call`.
#[derive(Clone)]
pub struct RemoteToolServer {
    id: String,
    url: String,
    auth_headers: HashMap<String, String>,
    next_id: Arc<AtomicU64>,
}

impl RemoteToolServer {
    pub fn new(options: RemoteServerOptions) -> Self {
        Self {
            id: options.id,
            url: options.url,
            auth_headers: options.auth_headers,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn list_tools(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<McpTool>, OrchestratorError> {
        let result = self.rpc(http, timeout, "tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
        name: &str,
        arguments: Value,
    ) -> Result<Value, OrchestratorError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.rpc(http, timeout, "tools/call", Some(params)).await
    }

    async fn rpc(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, OrchestratorError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method: method.to_string(),
            params,
        };
        debug!("MCP TX [{}] {}", self.id, method);

        let mut builder = http.post(&self.url).timeout(timeout).json(&request);
        for (header, value) in &self.auth_headers {
            builder = builder.header(header, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                OrchestratorError::Timeout(timeout.as_millis() as u64)
            } else {
                OrchestratorError::Execution(format!("mcp server '{}': {}", self.id, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::Protocol {
                server: self.id.clone(),
                detail: serde_json::json!({ "httpStatus": status.as_u16() }),
            });
        }

        let parsed: JsonRpcResponse =
            response
                .json()
                .await
                .map_err(|e| OrchestratorError::Protocol {
                    server: self.id.clone(),
                    detail: serde_json::json!({ "parse": e.to_string() }),
                })?;

        if let Some(error) = parsed.error {
            // Carry the original error payload for diagnostics.
            return Err(OrchestratorError::Protocol {
                server: self.id.clone(),
                detail: error,
            });
        }
        parsed.result.ok_or_else(|| OrchestratorError::Protocol {
            server: self.id.clone(),
            detail: serde_json::json!({ "missing": "result" }),
        })
    }
}
