//! Counting in-memory supervisor used by pool and gateway tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{InstanceKey, ProcessSupervisor, RunningWorker};

#[derive(Default)]
pub(crate) struct StubSupervisor {
    pub(crate) running: Mutex<HashMap<InstanceKey, RunningWorker>>,
    pub(crate) fail_stop: Mutex<HashSet<InstanceKey>>,
    pub(crate) spawn_count: AtomicUsize,
    pub(crate) spawn_delay_ms: u64,
    pub(crate) fail_spawn: bool,
    pub(crate) next_pid: AtomicU32,
}

impl StubSupervisor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_delay(ms: u64) -> Arc<Self> {
        Arc::new(Self {
            spawn_delay_ms: ms,
            ..Self::default()
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_spawn: true,
            ..Self::default()
        })
    }

    pub(crate) async fn insert_running(&self, key: InstanceKey, port: u16) {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running
            .lock()
            .await
            .insert(key.clone(), RunningWorker { key, pid, port });
    }

    pub(crate) fn spawns(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessSupervisor for StubSupervisor {
    async fn spawn(&self, key: &InstanceKey, port: u16) -> anyhow::Result<RunningWorker> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        if self.spawn_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.spawn_delay_ms)).await;
        }
        if self.fail_spawn {
            anyhow::bail!("spawn refused by stub");
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let worker = RunningWorker {
            key: key.clone(),
            pid,
            port,
        };
        self.running.lock().await.insert(key.clone(), worker.clone());
        Ok(worker)
    }

    async fn stop(&self, key: &InstanceKey) -> anyhow::Result<()> {
        if self.fail_stop.lock().await.contains(key) {
            anyhow::bail!("stop refused by stub");
        }
        self.running
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("not running"))?;
        Ok(())
    }

    async fn is_running(&self, key: &InstanceKey) -> bool {
        self.running.lock().await.contains_key(key)
    }

    async fn list_running(&self) -> Vec<RunningWorker> {
        self.running.lock().await.values().cloned().collect()
    }
}
