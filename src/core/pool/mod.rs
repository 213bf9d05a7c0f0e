//! Bounded instance pool: decides if/when a worker for (org, plugin) may
//! start, deduplicates concurrent start requests, tracks last activity and
//! evicts idle workers. Cleanup runs as a scheduler job, never on its own.

#[cfg(test)]
pub(crate) mod stub;
pub mod supervisor;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::core::error::OrchestratorError;
use crate::core::store::{OrchestratorStore, now_ms};

pub use supervisor::{InstanceKey, NativeSupervisor, ProcessSupervisor, RunningWorker};

const SLOT_POLL_MS: u64 = 1000;

type StartResult = Result<(), OrchestratorError>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub plugin_id: String,
    pub running: usize,
    pub max_allowed: usize,
    pub queued: usize,
}

pub struct InstancePoolManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    store: Arc<OrchestratorStore>,
    config: Arc<OrchestratorConfig>,
    /// In-memory last-activity per instance; authoritative over the
    /// persisted timestamp whenever present.
    activity: Mutex<HashMap<InstanceKey, u64>>,
    /// At most one start attempt per key; concurrent callers await the
    /// leader's result through the watch channel.
    starting: Mutex<HashMap<InstanceKey, watch::Receiver<Option<StartResult>>>>,
    /// Callers currently waiting for an admission slot, per plugin.
    queued: Mutex<HashMap<String, usize>>,
    /// Ports handed to in-flight starts. A starting worker is not in the
    /// supervisor's live list yet; reserving here keeps concurrent starts
    /// off the same port.
    reserved_ports: Mutex<HashSet<u16>>,
}

impl InstancePoolManager {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        store: Arc<OrchestratorStore>,
        config: Arc<OrchestratorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            store,
            config,
            activity: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            reserved_ports: Mutex::new(HashSet::new()),
        })
    }

    /// Idempotent and safe to call concurrently: concurrent calls for the
    /// same key converge on a single underlying start attempt.
    pub async fn ensure_instance_running(
        &self,
        organization_id: &str,
        plugin_id: &str,
    ) -> Result<(), OrchestratorError> {
        let key = InstanceKey::new(organization_id, plugin_id);

        let tx = {
            let mut starting = self.starting.lock().await;
            if let Some(rx) = starting.get(&key) {
                let rx = rx.clone();
                drop(starting);
                return self.await_in_flight(rx).await;
            }
            if self.supervisor.is_running(&key).await {
                drop(starting);
                self.update_activity(organization_id, plugin_id).await;
                return Ok(());
            }
            let (tx, rx) = watch::channel(None);
            starting.insert(key.clone(), rx);
            tx
        };

        let result = self.start_worker(&key).await;
        let _ = tx.send(Some(result.clone()));
        self.starting.lock().await.remove(&key);
        result
    }

    async fn await_in_flight(
        &self,
        mut rx: watch::Receiver<Option<StartResult>>,
    ) -> Result<(), OrchestratorError> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(OrchestratorError::StartFailed(
                    "start attempt was abandoned".into(),
                ));
            }
        }
    }

    async fn start_worker(&self, key: &InstanceKey) -> StartResult {
        self.wait_for_slot(&key.plugin_id).await?;

        let port = self.reserve_port().await;
        let result = match self.supervisor.spawn(key, port).await {
            Ok(worker) => {
                info!("Worker {} admitted (pid {}, port {})", key, worker.pid, worker.port);
                self.update_activity(&key.organization_id, &key.plugin_id)
                    .await;
                Ok(())
            }
            Err(e) => Err(OrchestratorError::StartFailed(e.to_string())),
        };
        self.reserved_ports.lock().await.remove(&port);
        result
    }

    /// Admission control: poll for a free slot under the plugin's cap.
    async fn wait_for_slot(&self, plugin_id: &str) -> Result<(), OrchestratorError> {
        let max_allowed = self.config.max_instances_for(plugin_id);
        let wait_budget = Duration::from_secs(self.config.pool.slot_wait_secs);
        let deadline = tokio::time::Instant::now() + wait_budget;
        let mut queued = false;

        let result = loop {
            let running = self.running_count(plugin_id).await;
            if running < max_allowed {
                break Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(OrchestratorError::PoolTimeout {
                    plugin: plugin_id.to_string(),
                    waited_ms: wait_budget.as_millis() as u64,
                });
            }
            if !queued {
                queued = true;
                *self
                    .queued
                    .lock()
                    .await
                    .entry(plugin_id.to_string())
                    .or_insert(0) += 1;
                debug!(
                    "Plugin '{}' at capacity ({}/{}), queueing",
                    plugin_id, running, max_allowed
                );
            }
            tokio::time::sleep(Duration::from_millis(SLOT_POLL_MS)).await;
        };

        if queued {
            let mut queued_map = self.queued.lock().await;
            if let Some(count) = queued_map.get_mut(plugin_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    queued_map.remove(plugin_id);
                }
            }
        }
        result
    }

    async fn running_count(&self, plugin_id: &str) -> usize {
        self.supervisor
            .list_running()
            .await
            .iter()
            .filter(|worker| worker.key.plugin_id == plugin_id)
            .count()
    }

    /// Lowest port held by neither a live worker nor another in-flight
    /// start. The reservation is released once the spawn settles.
    async fn reserve_port(&self) -> u16 {
        let taken: Vec<u16> = self
            .supervisor
            .list_running()
            .await
            .iter()
            .map(|worker| worker.port)
            .collect();
        let mut reserved = self.reserved_ports.lock().await;
        let mut port = self.config.worker_port_base;
        while taken.contains(&port) || reserved.contains(&port) {
            port += 1;
        }
        reserved.insert(port);
        port
    }

    /// Refresh the in-memory activity map and best-effort persist. A store
    /// failure never fails the caller's request.
    pub async fn update_activity(&self, organization_id: &str, plugin_id: &str) {
        let key = InstanceKey::new(organization_id, plugin_id);
        let ts = now_ms();
        self.activity.lock().await.insert(key, ts);
        if let Err(e) = self
            .store
            .set_instance_activity(plugin_id, organization_id, ts)
            .await
        {
            warn!(
                "Failed to persist activity for {}/{}: {}",
                organization_id, plugin_id, e
            );
        }
    }

    /// Persist the whole in-memory activity map. Runs as a periodic job
    /// so eviction survives an orchestrator restart.
    pub async fn flush_activity(&self) {
        let entries: Vec<(InstanceKey, u64)> = self
            .activity
            .lock()
            .await
            .iter()
            .map(|(key, ts)| (key.clone(), *ts))
            .collect();
        for (key, ts) in entries {
            if let Err(e) = self
                .store
                .set_instance_activity(&key.plugin_id, &key.organization_id, ts)
                .await
            {
                warn!("Failed to flush activity for {}: {}", key, e);
            }
        }
    }

    /// Stop every running worker idle past the inactivity timeout.
    /// Invoked by a scheduler job. Per-instance failures do not abort the
    /// sweep.
    pub async fn cleanup_inactive_instances(&self) -> usize {
        let timeout_ms = self.config.pool.inactivity_timeout_secs * 1000;
        let now = now_ms();
        let mut stopped = 0;

        for worker in self.supervisor.list_running().await {
            let key = &worker.key;
            let memory_activity = self.activity.lock().await.get(key).copied();
            let last_activity = match memory_activity {
                Some(ts) => Some(ts),
                None => self
                    .store
                    .get_instance_activity(&key.plugin_id, &key.organization_id)
                    .await
                    .unwrap_or(None),
            };
            let Some(last_activity) = last_activity else {
                // Unknown history: stamp now and give it a full window.
                self.activity.lock().await.insert(key.clone(), now);
                continue;
            };

            if now.saturating_sub(last_activity) > timeout_ms {
                info!(
                    "Evicting idle worker {} (inactive {}ms)",
                    key,
                    now.saturating_sub(last_activity)
                );
                match self.supervisor.stop(key).await {
                    Ok(()) => {
                        self.activity.lock().await.remove(key);
                        stopped += 1;
                    }
                    Err(e) => warn!("Failed to stop idle worker {}: {}", key, e),
                }
            }
        }
        stopped
    }

    /// Tenant-level teardown: stop every running instance of one org.
    pub async fn stop_all_for_organization(&self, organization_id: &str) -> usize {
        let mut stopped = 0;
        for worker in self.supervisor.list_running().await {
            if worker.key.organization_id != organization_id {
                continue;
            }
            match self.supervisor.stop(&worker.key).await {
                Ok(()) => {
                    self.activity.lock().await.remove(&worker.key);
                    stopped += 1;
                }
                Err(e) => warn!("Failed to stop worker {}: {}", worker.key, e),
            }
        }
        info!(
            "Stopped {} worker(s) for organization '{}'",
            stopped, organization_id
        );
        stopped
    }

    pub async fn stop_all(&self) {
        for worker in self.supervisor.list_running().await {
            if let Err(e) = self.supervisor.stop(&worker.key).await {
                warn!("Failed to stop worker {}: {}", worker.key, e);
            }
        }
        self.activity.lock().await.clear();
    }

    /// Always derived fresh from the supervisor's live list.
    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let running = self.supervisor.list_running().await;
        let queued = self.queued.lock().await.clone();

        let mut per_plugin: HashMap<String, usize> = HashMap::new();
        for worker in &running {
            *per_plugin.entry(worker.key.plugin_id.clone()).or_insert(0) += 1;
        }
        for plugin_id in queued.keys() {
            per_plugin.entry(plugin_id.clone()).or_insert(0);
        }

        let mut stats: Vec<PoolStats> = per_plugin
            .into_iter()
            .map(|(plugin_id, count)| PoolStats {
                max_allowed: self.config.max_instances_for(&plugin_id),
                queued: queued.get(&plugin_id).copied().unwrap_or(0),
                running: count,
                plugin_id,
            })
            .collect();
        stats.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        stats
    }

    /// Port the named worker is serving on, if it is running.
    pub async fn worker_port(&self, organization_id: &str, plugin_id: &str) -> Option<u16> {
        let key = InstanceKey::new(organization_id, plugin_id);
        self.supervisor
            .list_running()
            .await
            .into_iter()
            .find(|worker| worker.key == key)
            .map(|worker| worker.port)
    }
}
