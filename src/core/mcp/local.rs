//! Subprocess-backed local tool server: newline-delimited JSON-RPC 2.0
//! over the child's stdin/stdout.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, warn};

use super::{JsonRpcRequest, JsonRpcResponse, McpTool, ToolServerHandle};

const INIT_TIMEOUT: Duration = Duration::from_secs(15);
const STDERR_TAIL_LIMIT: usize = 2000;

/// Initializer that spawns the configured subprocess when the router
/// registers it. Used for tool servers a plugin declares in its manifest.
pub fn stdio_initializer(
    id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
) -> super::LocalInitializer {
    Box::new(move |_context| {
        Box::pin(async move {
            let server = StdioToolServer::spawn(&id, &command, args, env).await?;
            Ok(server as Arc<dyn ToolServerHandle>)
        })
    })
}

pub struct StdioToolServer {
    id: String,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    outbound: mpsc::Sender<String>,
    stderr_tail: Arc<Mutex<String>>,
}

impl StdioToolServer {
    pub async fn spawn(
        id: &str,
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        debug!("Spawning stdio tool server '{}' ({})", id, command);
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin pipe for tool server '{}'", id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout pipe for tool server '{}'", id))?;
        let stderr = child.stderr.take();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(100);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stderr_tail = Arc::new(Mutex::new(String::new()));

        let server = Arc::new(Self {
            id: id.to_string(),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(1),
            pending: pending.clone(),
            outbound,
            stderr_tail: stderr_tail.clone(),
        });

        // Writer: serialize one request per line onto stdin.
        let mut writer = tokio::io::BufWriter::new(stdin);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = writer.write_all(format!("{}\n", frame).as_bytes()).await {
                    error!("stdio tool server write failed: {}", e);
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        // Reader: match response ids against the pending map.
        let reader_pending = pending.clone();
        let reader_id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(response) => {
                        if let Some(tx) = reader_pending.lock().await.remove(&response.id) {
                            let _ = tx.send(response);
                        }
                    }
                    Err(_) => warn!("Unparsed frame from tool server [{}]: {}", reader_id, line),
                }
            }
            warn!("stdout closed for tool server [{}]", reader_id);
            reader_pending.lock().await.clear();
        });

        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = tail.lock().await;
                    if buf.len() < STDERR_TAIL_LIMIT {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            });
        }

        match tokio::time::timeout(INIT_TIMEOUT, server.initialize()).await {
            Ok(Ok(())) => Ok(server),
            Ok(Err(e)) => {
                let tail = server.stderr_tail.lock().await.clone();
                Err(anyhow!(
                    "tool server '{}' failed to initialize: {}. stderr: {}",
                    id,
                    e,
                    tail
                ))
            }
            Err(_) => {
                let tail = server.stderr_tail.lock().await.clone();
                Err(anyhow!(
                    "tool server '{}' initialization timed out. stderr: {}",
                    id,
                    tail
                ))
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "plugdock-worker", "version": env!("CARGO_PKG_VERSION") }
        });
        self.request("initialize", Some(params)).await?;
        let initialized = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        });
        self.outbound.send(initialized.to_string()).await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        self.outbound.send(serde_json::to_string(&request)?).await?;

        let response = rx
            .await
            .map_err(|_| anyhow!("tool server '{}' dropped request {}", self.id, id))?;
        if let Some(error) = response.error {
            return Err(anyhow!("rpc error from '{}': {}", self.id, error));
        }
        response
            .result
            .ok_or_else(|| anyhow!("rpc response from '{}' missing result", self.id))
    }
}

#[async_trait]
impl ToolServerHandle for StdioToolServer {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        Ok(result
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.request("tools/call", Some(params)).await
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            child.start_kill()?;
            let _ = child.wait().await;
        }
        Ok(())
    }
}
