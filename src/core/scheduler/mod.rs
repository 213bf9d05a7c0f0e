//! Generic registry of named background jobs with interval-or-cron
//! schedules, singleton/timeout/retry policy and execution bookkeeping.

pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::core::error::OrchestratorError;
use crate::core::store::{OrchestratorStore, now_ms};

pub use types::{JobDefinition, JobHandler, JobOutcome, JobRuntimeState, JobStatus, Schedule};

const MIN_INTERVAL_MS: u64 = 1000;
const MIN_TIMEOUT_MS: u64 = 1000;
const RETRY_DELAY_MS: u64 = 1000;
const SHUTDOWN_POLL_MS: u64 = 100;

enum Trigger {
    Disarmed,
    Interval(JoinHandle<()>),
    Cron(uuid::Uuid),
}

struct JobEntry {
    def: JobDefinition,
    state: Mutex<JobRuntimeState>,
    trigger: Mutex<Trigger>,
}

struct EngineInner {
    jobs: Mutex<HashMap<String, Arc<JobEntry>>>,
    cron: Mutex<JobScheduler>,
    store: Option<Arc<OrchestratorStore>>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

impl SchedulerEngine {
    pub async fn new(store: Option<Arc<OrchestratorStore>>) -> anyhow::Result<Self> {
        let cron = JobScheduler::new().await?;
        cron.start().await?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                jobs: Mutex::new(HashMap::new()),
                cron: Mutex::new(cron),
                store,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub async fn register_job(&self, def: JobDefinition) -> Result<(), OrchestratorError> {
        validate_definition(&def)?;

        let entry = Arc::new(JobEntry {
            def: def.clone(),
            state: Mutex::new(JobRuntimeState::default()),
            trigger: Mutex::new(Trigger::Disarmed),
        });

        {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.contains_key(&def.name) {
                return Err(OrchestratorError::Duplicate(format!(
                    "job '{}' is already registered",
                    def.name
                )));
            }
            jobs.insert(def.name.clone(), entry.clone());
        }

        if def.enabled {
            arm(&self.inner, &entry).await?;
        }
        if def.run_on_startup {
            debug!("Job '{}' firing startup execution", def.name);
            tokio::spawn(run_once(self.inner.clone(), entry.clone()));
        }

        info!("Registered job '{}' ({})", def.name, def.schedule.describe());
        Ok(())
    }

    pub async fn unregister_job(&self, name: &str) -> Result<(), OrchestratorError> {
        let entry = {
            let mut jobs = self.inner.jobs.lock().await;
            jobs.remove(name)
                .ok_or_else(|| OrchestratorError::NotFound(format!("job '{}'", name)))?
        };
        disarm(&self.inner, &entry).await;
        info!("Unregistered job '{}'", name);
        Ok(())
    }

    /// Re-arms the trigger. Accumulated statistics survive.
    pub async fn enable_job(&self, name: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(name).await?;
        {
            let trigger = entry.trigger.lock().await;
            if !matches!(*trigger, Trigger::Disarmed) {
                return Ok(());
            }
        }
        arm(&self.inner, &entry).await
    }

    /// Disarms the trigger. Accumulated statistics survive.
    pub async fn disable_job(&self, name: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(name).await?;
        disarm(&self.inner, &entry).await;
        Ok(())
    }

    /// Execute a job immediately, outside of its schedule, under the same
    /// singleton/timeout/retry rules. Waits for the execution to settle.
    pub async fn run_job(&self, name: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(name).await?;
        run_once(self.inner.clone(), entry).await;
        Ok(())
    }

    pub async fn job_status(&self, name: &str) -> Result<JobStatus, OrchestratorError> {
        let entry = self.entry(name).await?;
        Ok(snapshot(&entry).await)
    }

    pub async fn job_statuses(&self) -> Vec<JobStatus> {
        let entries: Vec<Arc<JobEntry>> =
            self.inner.jobs.lock().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            statuses.push(snapshot(&entry).await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop accepting new fires, wait up to `graceful_timeout` for running
    /// jobs (polling every 100ms), then disarm everything and clear the
    /// registry even if stragglers remain.
    pub async fn shutdown(&self, graceful_timeout: Duration) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        info!("Scheduler engine shutting down...");

        let deadline = tokio::time::Instant::now() + graceful_timeout;
        loop {
            let entries: Vec<Arc<JobEntry>> =
                self.inner.jobs.lock().await.values().cloned().collect();
            let mut still_running = Vec::new();
            for entry in &entries {
                if entry.state.lock().await.is_running {
                    still_running.push(entry.def.name.clone());
                }
            }
            if still_running.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Graceful shutdown window elapsed with jobs still running: {:?}",
                    still_running
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
        }

        let mut jobs = self.inner.jobs.lock().await;
        for entry in jobs.values() {
            disarm(&self.inner, entry).await;
        }
        jobs.clear();
        if let Err(e) = self.inner.cron.lock().await.shutdown().await {
            warn!("Cron scheduler shutdown error: {}", e);
        }
        info!("Scheduler engine stopped.");
    }

    async fn entry(&self, name: &str) -> Result<Arc<JobEntry>, OrchestratorError> {
        self.inner
            .jobs
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("job '{}'", name)))
    }
}

fn validate_definition(def: &JobDefinition) -> Result<(), OrchestratorError> {
    if def.name.trim().is_empty() {
        return Err(OrchestratorError::Config("job name must not be empty".into()));
    }
    if def.description.trim().is_empty() {
        return Err(OrchestratorError::Config(
            "job description must not be empty".into(),
        ));
    }
    match &def.schedule {
        Schedule::IntervalMs(ms) if *ms < MIN_INTERVAL_MS => {
            return Err(OrchestratorError::Config(format!(
                "interval {}ms is below the {}ms minimum",
                ms, MIN_INTERVAL_MS
            )));
        }
        Schedule::IntervalMs(_) => {}
        Schedule::Cron(expr) => {
            normalize_cron(expr)?;
        }
    }
    if let Some(ms) = def.timeout_ms
        && ms < MIN_TIMEOUT_MS
    {
        return Err(OrchestratorError::Config(format!(
            "timeout {}ms is below the {}ms minimum",
            ms, MIN_TIMEOUT_MS
        )));
    }
    if def.retry_on_failure && def.max_retries.unwrap_or(0) < 1 {
        return Err(OrchestratorError::Config(
            "max_retries must be >= 1 when retry_on_failure is set".into(),
        ));
    }
    Ok(())
}

/// Accepts a standard 5-field expression and prepends the seconds field
/// the trigger library expects. Parse errors are configuration errors.
fn normalize_cron(expr: &str) -> Result<String, OrchestratorError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(OrchestratorError::Config(format!(
            "cron expression '{}' must have exactly 5 fields",
            expr
        )));
    }
    let normalized = format!("0 {}", fields.join(" "));
    // Build a throwaway trigger to surface grammar errors at registration.
    Job::new_async(normalized.as_str(), |_uuid, _sched| Box::pin(async {})).map_err(|e| {
        OrchestratorError::Config(format!("invalid cron expression '{}': {}", expr, e))
    })?;
    Ok(normalized)
}

async fn arm(inner: &Arc<EngineInner>, entry: &Arc<JobEntry>) -> Result<(), OrchestratorError> {
    let mut trigger = entry.trigger.lock().await;
    match &entry.def.schedule {
        Schedule::IntervalMs(ms) => {
            let period = Duration::from_millis(*ms);
            let inner_task = inner.clone();
            let entry_task = entry.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    if inner_task.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::spawn(run_once(inner_task.clone(), entry_task.clone()));
                }
            });
            *trigger = Trigger::Interval(handle);
        }
        Schedule::Cron(expr) => {
            let normalized = normalize_cron(expr)?;
            let inner_fire = inner.clone();
            let entry_fire = entry.clone();
            let job = Job::new_async(normalized.as_str(), move |_uuid, _sched| {
                let inner = inner_fire.clone();
                let entry = entry_fire.clone();
                Box::pin(async move {
                    run_once(inner, entry).await;
                })
            })
            .map_err(|e| {
                OrchestratorError::Config(format!("invalid cron expression '{}': {}", expr, e))
            })?;
            let id = inner.cron.lock().await.add(job).await.map_err(|e| {
                OrchestratorError::Execution(format!("failed to arm cron trigger: {}", e))
            })?;
            *trigger = Trigger::Cron(id);
        }
    }
    Ok(())
}

async fn disarm(inner: &Arc<EngineInner>, entry: &Arc<JobEntry>) {
    let mut trigger = entry.trigger.lock().await;
    match std::mem::replace(&mut *trigger, Trigger::Disarmed) {
        Trigger::Disarmed => {}
        Trigger::Interval(handle) => handle.abort(),
        Trigger::Cron(id) => {
            if let Err(e) = inner.cron.lock().await.remove(&id).await {
                warn!("Failed to remove cron trigger for '{}': {}", entry.def.name, e);
            }
        }
    }
}

/// One logical execution: singleton gate, timeout race, retry loop,
/// bookkeeping, persistence. The running flag is cleared on every path.
async fn run_once(inner: Arc<EngineInner>, entry: Arc<JobEntry>) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut state = entry.state.lock().await;
        if entry.def.singleton && state.is_running {
            debug!("Job '{}' already running, singleton skip", entry.def.name);
            return;
        }
        state.is_running = true;
    }

    let started_at = now_ms();
    let mut retry_count: u32 = 0;
    let (final_outcome, final_error, final_duration) = loop {
        let t0 = tokio::time::Instant::now();
        let result: Result<(), (JobOutcome, String)> = match entry.def.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), (entry.def.handler)()).await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err((JobOutcome::Failed, e.to_string())),
                    // The losing handler future is dropped here, not killed;
                    // it can only ever have reported through its return value.
                    Err(_) => Err((JobOutcome::Timeout, format!("timed out after {}ms", ms))),
                }
            }
            None => (entry.def.handler)()
                .await
                .map_err(|e| (JobOutcome::Failed, e.to_string())),
        };
        let duration = t0.elapsed().as_millis() as u64;

        {
            let mut state = entry.state.lock().await;
            state.last_run_ms = Some(started_at);
            state.last_duration_ms = Some(duration);
            state.total_runs += 1;
            state.total_duration_ms += duration;
            match &result {
                Ok(()) => {
                    state.last_status = Some(JobOutcome::Success);
                    state.last_error = None;
                }
                Err((outcome, msg)) => {
                    state.last_status = Some(*outcome);
                    state.last_error = Some(msg.clone());
                    state.total_failures += 1;
                }
            }
        }

        match result {
            Ok(()) => break (JobOutcome::Success, None, duration),
            Err((outcome, msg)) => {
                let budget = entry.def.max_retries.unwrap_or(0);
                if entry.def.retry_on_failure && retry_count < budget {
                    retry_count += 1;
                    warn!(
                        "Job '{}' {} ({}), retry {}/{}",
                        entry.def.name,
                        outcome.as_str(),
                        msg,
                        retry_count,
                        budget
                    );
                    tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                    continue;
                }
                warn!("Job '{}' {}: {}", entry.def.name, outcome.as_str(), msg);
                break (outcome, Some(msg), duration);
            }
        }
    };

    // Retries replace the pending result; only the settled outcome is persisted.
    if !entry.def.skip_db_logging
        && let Some(store) = &inner.store
        && let Err(e) = store
            .record_job_run(
                &entry.def.name,
                final_outcome.as_str(),
                final_error.as_deref(),
                final_duration,
                started_at,
            )
            .await
    {
        warn!(
            "Failed to persist run record for job '{}': {}",
            entry.def.name, e
        );
    }

    entry.state.lock().await.is_running = false;
}

async fn snapshot(entry: &Arc<JobEntry>) -> JobStatus {
    let enabled = !matches!(*entry.trigger.lock().await, Trigger::Disarmed);
    let state = entry.state.lock().await;
    let average_duration_ms = if state.total_runs > 0 {
        state.total_duration_ms / state.total_runs
    } else {
        0
    };
    let next_run_ms = match entry.def.schedule {
        Schedule::IntervalMs(interval) => state.last_run_ms.map(|last| last + interval),
        Schedule::Cron(_) => None,
    };
    JobStatus {
        name: entry.def.name.clone(),
        description: entry.def.description.clone(),
        schedule: entry.def.schedule.describe(),
        enabled,
        is_running: state.is_running,
        last_run_ms: state.last_run_ms,
        last_status: state.last_status,
        last_error: state.last_error.clone(),
        last_duration_ms: state.last_duration_ms,
        total_runs: state.total_runs,
        total_failures: state.total_failures,
        average_duration_ms,
        next_run_ms,
    }
}
