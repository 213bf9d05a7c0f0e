//! Daemon boot: wire the store, pool, scheduler engine and gateway
//! together, register the orchestrator's own periodic jobs and run until
//! interrupted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::core::pool::{InstancePoolManager, NativeSupervisor};
use crate::core::scheduler::{JobDefinition, Schedule, SchedulerEngine};
use crate::core::store::OrchestratorStore;
use crate::interfaces::web::{GatewayServer, RateLimiter};
use crate::logging::BroadcastMakeWriter;
use crate::worker::plugin;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct DaemonFlags {
    pub config_path: String,
}

pub async fn run(flags: DaemonFlags) -> Result<()> {
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(256);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(BroadcastMakeWriter {
            sender: log_tx.clone(),
        })
        .init();

    let config = Arc::new(OrchestratorConfig::load(&flags.config_path).await?);
    let store = Arc::new(OrchestratorStore::open(&config.db_path)?);
    let supervisor = NativeSupervisor::new();
    let pool = InstancePoolManager::new(supervisor, store.clone(), config.clone());
    let engine = SchedulerEngine::new(Some(store.clone())).await?;
    let rate_limiter = RateLimiter::new(
        config.rate_limit.max_requests,
        config.rate_limit.window_secs,
    );

    register_boot_jobs(&engine, &pool, &rate_limiter).await?;

    GatewayServer {
        engine: engine.clone(),
        pool: pool.clone(),
        store,
        config,
        manifests: plugin::builtin_manifests(),
        rate_limiter,
        log_tx,
    }
    .start()
    .await?;

    info!("plugdock daemon up; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.shutdown(SHUTDOWN_GRACE).await;
    pool.stop_all().await;
    info!("Goodbye.");
    Ok(())
}

/// The orchestrator's own periodic maintenance, run through the same
/// engine as everything else.
async fn register_boot_jobs(
    engine: &SchedulerEngine,
    pool: &Arc<InstancePoolManager>,
    rate_limiter: &Arc<RateLimiter>,
) -> Result<()> {
    let cleanup_pool = pool.clone();
    engine
        .register_job(
            JobDefinition::new(
                "instance-cleanup",
                "Evict workers idle past the inactivity timeout",
                Schedule::IntervalMs(60_000),
                Arc::new(move || {
                    let pool = cleanup_pool.clone();
                    Box::pin(async move {
                        let stopped = pool.cleanup_inactive_instances().await;
                        if stopped > 0 {
                            info!("Instance cleanup evicted {} worker(s)", stopped);
                        }
                        Ok(())
                    })
                }),
            )
            .singleton(),
        )
        .await?;

    let prune_limiter = rate_limiter.clone();
    engine
        .register_job(
            JobDefinition::new(
                "rate-limit-prune",
                "Drop expired rate limit windows",
                Schedule::Cron("*/5 * * * *".to_string()),
                Arc::new(move || {
                    let limiter = prune_limiter.clone();
                    Box::pin(async move {
                        limiter.prune_expired().await;
                        Ok(())
                    })
                }),
            )
            .skip_db_logging(),
        )
        .await?;

    let flush_pool = pool.clone();
    engine
        .register_job(
            JobDefinition::new(
                "activity-flush",
                "Persist in-memory worker activity timestamps",
                Schedule::IntervalMs(30_000),
                Arc::new(move || {
                    let pool = flush_pool.clone();
                    Box::pin(async move {
                        pool.flush_activity().await;
                        Ok(())
                    })
                }),
            )
            .skip_db_logging(),
        )
        .await?;

    Ok(())
}
