use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed no-argument effectful handler. Handlers report outcomes only
/// through their return value; an execution abandoned by a timeout race
/// therefore cannot corrupt engine state.
pub type JobHandler =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Fixed interval in milliseconds, minimum 1000.
    IntervalMs(u64),
    /// Standard 5-field cron expression.
    Cron(String),
}

impl Schedule {
    pub fn describe(&self) -> String {
        match self {
            Schedule::IntervalMs(ms) => format!("every {}ms", ms),
            Schedule::Cron(expr) => format!("cron {}", expr),
        }
    }
}

#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub handler: JobHandler,
    pub enabled: bool,
    pub timeout_ms: Option<u64>,
    pub retry_on_failure: bool,
    pub max_retries: Option<u32>,
    pub singleton: bool,
    pub run_on_startup: bool,
    pub skip_db_logging: bool,
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schedule: Schedule,
        handler: JobHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schedule,
            handler,
            enabled: true,
            timeout_ms: None,
            retry_on_failure: false,
            max_retries: None,
            singleton: false,
            run_on_startup: false,
            skip_db_logging: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = Some(max_retries);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn run_on_startup(mut self) -> Self {
        self.run_on_startup = true;
        self
    }

    pub fn skip_db_logging(mut self) -> Self {
        self.skip_db_logging = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failed,
    Timeout,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failed => "failed",
            JobOutcome::Timeout => "timeout",
        }
    }
}

/// Mutable execution bookkeeping, owned exclusively by the engine.
#[derive(Debug, Default)]
pub struct JobRuntimeState {
    pub is_running: bool,
    pub last_run_ms: Option<u64>,
    pub last_status: Option<JobOutcome>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub total_runs: u64,
    pub total_failures: u64,
    pub total_duration_ms: u64,
}

/// Read-only snapshot returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub description: String,
    pub schedule: String,
    pub enabled: bool,
    pub is_running: bool,
    pub last_run_ms: Option<u64>,
    pub last_status: Option<JobOutcome>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub total_runs: u64,
    pub total_failures: u64,
    pub average_duration_ms: u64,
    /// Best-effort estimate, interval jobs only. Cron jobs report none;
    /// the trigger library owns their fire times.
    pub next_run_ms: Option<u64>,
}
