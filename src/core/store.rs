use anyhow::Result;
use rusqlite::{Connection, params};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Narrow persistence surface the orchestrator needs: job execution
/// records, plugin instance rows and org-scoped secrets. Everything else
/// the platform stores (conversations, customers, templates) lives
/// elsewhere and is never modeled here.
pub struct OrchestratorStore {
    db: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunRecord {
    pub job_name: String,
    pub status: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub plugin_id: String,
    pub organization_id: String,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub last_activity_ms: Option<u64>,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl OrchestratorStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path)?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                started_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS plugin_instances (
                plugin_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL DEFAULT '{}',
                last_activity_ms INTEGER,
                PRIMARY KEY (plugin_id, organization_id)
            );
            CREATE TABLE IF NOT EXISTS org_secrets (
                organization_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (organization_id, key)
            );",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    // === Job execution records ===

    pub async fn record_job_run(
        &self,
        job_name: &str,
        status: &str,
        error: Option<&str>,
        duration_ms: u64,
        started_at_ms: u64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO job_runs (job_name, status, error, duration_ms, started_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_name, status, error, duration_ms as i64, started_at_ms as i64],
        )?;
        Ok(())
    }

    pub async fn recent_job_runs(&self, job_name: &str, limit: u32) -> Result<Vec<JobRunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT job_name, status, error, duration_ms, started_at_ms FROM job_runs
             WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_name, limit], |row| {
            Ok(JobRunRecord {
                job_name: row.get(0)?,
                status: row.get(1)?,
                error: row.get(2)?,
                duration_ms: row.get::<_, i64>(3)? as u64,
                started_at_ms: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // === Plugin instances ===

    pub async fn upsert_instance(
        &self,
        plugin_id: &str,
        organization_id: &str,
        enabled: bool,
        config: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO plugin_instances (plugin_id, organization_id, enabled, config)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (plugin_id, organization_id)
             DO UPDATE SET enabled = ?3, config = ?4",
            params![plugin_id, organization_id, enabled, config.to_string()],
        )?;
        Ok(())
    }

    pub async fn get_instance(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Result<Option<InstanceRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT plugin_id, organization_id, enabled, config, last_activity_ms
             FROM plugin_instances WHERE plugin_id = ?1 AND organization_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![plugin_id, organization_id], |row| {
            let config_str: String = row.get(3)?;
            Ok(InstanceRecord {
                plugin_id: row.get(0)?,
                organization_id: row.get(1)?,
                enabled: row.get::<_, i64>(2)? != 0,
                config: serde_json::from_str(&config_str)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
                last_activity_ms: row.get::<_, Option<i64>>(4)?.map(|ts| ts as u64),
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn set_instance_activity(
        &self,
        plugin_id: &str,
        organization_id: &str,
        ts_ms: u64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE plugin_instances SET last_activity_ms = ?3
             WHERE plugin_id = ?1 AND organization_id = ?2",
            params![plugin_id, organization_id, ts_ms as i64],
        )?;
        Ok(())
    }

    pub async fn get_instance_activity(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Result<Option<u64>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT last_activity_ms FROM plugin_instances
             WHERE plugin_id = ?1 AND organization_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![plugin_id, organization_id], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        match rows.next() {
            Some(row) => Ok(row?.map(|ts| ts as u64)),
            None => Ok(None),
        }
    }

    // === Org-scoped secrets ===

    pub async fn set_secret(&self, organization_id: &str, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO org_secrets (organization_id, key, value)
             VALUES (?1, ?2, ?3)",
            params![organization_id, key, value],
        )?;
        Ok(())
    }

    pub async fn get_secret(&self, organization_id: &str, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT value FROM org_secrets WHERE organization_id = ?1 AND key = ?2")?;
        let mut rows = stmt.query_map(params![organization_id, key], |row| row.get(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Merged view of an organization's environment for one plugin:
    /// org secrets overlaid on the instance config's string fields.
    /// Used to resolve webhook signing secrets; process env is never
    /// consulted here.
    pub async fn merged_env(
        &self,
        organization_id: &str,
        plugin_id: &str,
    ) -> Result<HashMap<String, String>> {
        let mut env = HashMap::new();
        if let Some(instance) = self.get_instance(plugin_id, organization_id).await?
            && let Some(obj) = instance.config.as_object()
        {
            for (k, v) in obj {
                if let Some(s) = v.as_str() {
                    env.insert(k.clone(), s.to_string());
                }
            }
        }
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT key, value FROM org_secrets WHERE organization_id = ?1")?;
        let rows = stmt.query_map(params![organization_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (k, v) = row?;
            env.insert(k, v);
        }
        Ok(env)
    }
}
