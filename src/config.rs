use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// First port handed to spawned workers; allocation walks upward from here.
    #[serde(default = "default_worker_port_base")]
    pub worker_port_base: u16,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// sqlite database path; ":memory:" is accepted for tests.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Cap on concurrently running workers per plugin unless overridden.
    #[serde(default = "default_max_instances")]
    pub default_max_instances: usize,

    /// Per-plugin overrides of the instance cap.
    #[serde(default)]
    pub max_instances: HashMap<String, usize>,

    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// How long ensure_instance_running waits for a free slot.
    #[serde(default = "default_slot_wait_secs")]
    pub slot_wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max")]
    pub max_requests: u32,

    #[serde(default = "default_rate_limit_window_secs")]
    pub window_secs: u64,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    18420
}
fn default_worker_port_base() -> u16 {
    18500
}
fn default_db_path() -> String {
    "plugdock.db".to_string()
}
fn default_max_instances() -> usize {
    10
}
fn default_inactivity_timeout_secs() -> u64 {
    300
}
fn default_slot_wait_secs() -> u64 {
    30
}
fn default_rate_limit_max() -> u32 {
    100
}
fn default_rate_limit_window_secs() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
            worker_port_base: default_worker_port_base(),
            pool: PoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            db_path: default_db_path(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_max_instances: default_max_instances(),
            max_instances: HashMap::new(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            slot_wait_secs: default_slot_wait_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_rate_limit_max(),
            window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using defaults.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: OrchestratorConfig = toml::from_str(&content)?;
        info!(
            "Loaded config: api={}:{}, worker ports from {}",
            config.api_host, config.api_port, config.worker_port_base
        );
        Ok(config)
    }

    pub fn max_instances_for(&self, plugin_id: &str) -> usize {
        self.pool
            .max_instances
            .get(plugin_id)
            .copied()
            .unwrap_or(self.pool.default_max_instances)
    }
}
