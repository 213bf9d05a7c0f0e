use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identifies one worker process: (organization, plugin).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceKey {
    pub organization_id: String,
    pub plugin_id: String,
}

impl InstanceKey {
    pub fn new(organization_id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            plugin_id: plugin_id.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.plugin_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningWorker {
    pub key: InstanceKey,
    pub pid: u32,
    pub port: u16,
}

/// Owns the actual OS processes. Its live list is the single source of
/// truth for "is this worker running"; the pool manager never keeps its
/// own counters. Swappable for a test double.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn spawn(&self, key: &InstanceKey, port: u16) -> Result<RunningWorker>;
    async fn stop(&self, key: &InstanceKey) -> Result<()>;
    async fn is_running(&self, key: &InstanceKey) -> bool;
    async fn list_running(&self) -> Vec<RunningWorker>;
}

struct WorkerProcess {
    child: Child,
    pid: u32,
    port: u16,
}

/// Spawns `plugdock worker --org .. --plugin .. --port ..` children from
/// the current executable.
pub struct NativeSupervisor {
    workers: Mutex<HashMap<InstanceKey, WorkerProcess>>,
    health_wait: Duration,
}

const STOP_GRACE: Duration = Duration::from_secs(5);

impl NativeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            health_wait: Duration::from_secs(10),
        })
    }

    async fn wait_for_health(&self, key: &InstanceKey, port: u16) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/health", port);
        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + self.health_wait;
        loop {
            if let Ok(resp) = client
                .get(&url)
                .timeout(Duration::from_millis(500))
                .send()
                .await
                && resp.status().is_success()
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "worker {} did not become healthy on port {} within {:?}",
                    key,
                    port,
                    self.health_wait
                ));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for NativeSupervisor {
    async fn spawn(&self, key: &InstanceKey, port: u16) -> Result<RunningWorker> {
        {
            let mut workers = self.workers.lock().await;
            reap_exited(&mut workers);
            if workers.contains_key(key) {
                return Err(anyhow!("worker {} is already running", key));
            }
        }

        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--org")
            .arg(&key.organization_id)
            .arg("--plugin")
            .arg(&key.plugin_id)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("worker {} exited before pid was read", key))?;
        info!("Spawned worker {} (pid {}, port {})", key, pid, port);

        if let Err(e) = self.wait_for_health(key, port).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        let worker = RunningWorker {
            key: key.clone(),
            pid,
            port,
        };
        self.workers
            .lock()
            .await
            .insert(key.clone(), WorkerProcess { child, pid, port });
        Ok(worker)
    }

    async fn stop(&self, key: &InstanceKey) -> Result<()> {
        let mut process = {
            let mut workers = self.workers.lock().await;
            workers
                .remove(key)
                .ok_or_else(|| anyhow!("worker {} is not running", key))?
        };

        // SIGTERM first so the worker runs its disable hook; escalate after
        // the grace window.
        let _ = std::process::Command::new("kill")
            .arg("-15")
            .arg(process.pid.to_string())
            .output();
        match tokio::time::timeout(STOP_GRACE, process.child.wait()).await {
            Ok(status) => {
                info!("Worker {} exited: {:?}", key, status?);
            }
            Err(_) => {
                warn!("Worker {} ignored SIGTERM, killing", key);
                process.child.start_kill()?;
                process.child.wait().await?;
            }
        }
        Ok(())
    }

    async fn is_running(&self, key: &InstanceKey) -> bool {
        let mut workers = self.workers.lock().await;
        reap_exited(&mut workers);
        workers.contains_key(key)
    }

    async fn list_running(&self) -> Vec<RunningWorker> {
        let mut workers = self.workers.lock().await;
        reap_exited(&mut workers);
        workers
            .iter()
            .map(|(key, process)| RunningWorker {
                key: key.clone(),
                pid: process.pid,
                port: process.port,
            })
            .collect()
    }
}

/// Drop entries whose process has already exited so a worker dying outside
/// our control never counts against the pool.
fn reap_exited(workers: &mut HashMap<InstanceKey, WorkerProcess>) {
    workers.retain(|key, process| match process.child.try_wait() {
        Ok(Some(status)) => {
            warn!("Worker {} exited on its own: {:?}", key, status);
            false
        }
        Ok(None) => true,
        Err(e) => {
            warn!("Failed to poll worker {}: {}", key, e);
            false
        }
    });
}
