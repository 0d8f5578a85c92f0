//! Engine configuration
//!
//! Defaults match the documented operating values; every knob can be
//! overridden through `SCRAWL_*` environment variables.

use crate::error::{PipelineError, PipelineResult};
use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::queue::job::JobType;
use crate::queue::QueueConfig;
use crate::worker::WorkerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sled data directory; absent means an ephemeral store
    pub data_dir: Option<PathBuf>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub orchestrator: OrchestratorConfig,
    pub monitor: MonitorConfig,
    /// Per-subscriber progress bus buffer
    pub event_buffer: usize,
    /// Terminal workflow retention
    pub retention: Duration,
}

impl EngineConfig {
    /// Defaults plus `SCRAWL_*` environment overrides
    pub fn from_env() -> PipelineResult<Self> {
        let mut config = Self::default_values();

        if let Ok(dir) = std::env::var("SCRAWL_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        for job_type in JobType::ALL {
            let key = format!("SCRAWL_WORKER_{}", job_type.as_str().to_uppercase());
            if let Some(n) = read_env(&key)? {
                config.worker.concurrency.insert(job_type, n);
            }
            let key = format!(
                "SCRAWL_STAGE_TIMEOUT_{}_SECS",
                job_type.as_str().to_uppercase()
            );
            if let Some(secs) = read_env(&key)? {
                config
                    .worker
                    .stage_timeouts
                    .insert(job_type, Duration::from_secs(secs));
            }
        }
        if let Some(secs) = read_env("SCRAWL_LEASE_TTL_SECS")? {
            config.queue.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = read_env("SCRAWL_MAX_PAYLOAD_BYTES")? {
            config.queue.max_payload_bytes = bytes;
        }
        if let Some(ms) = read_env("SCRAWL_BACKOFF_BASE_MS")? {
            config.orchestrator.backoff.base_ms = ms;
        }
        if let Some(ms) = read_env("SCRAWL_BACKOFF_CAP_MS")? {
            config.orchestrator.backoff.cap_ms = ms;
        }
        if let Some(n) = read_env("SCRAWL_MAX_ATTEMPTS")? {
            config.orchestrator.max_attempts = n;
        }
        if let Some(secs) = read_env("SCRAWL_QUOTA_RETRY_DELAY_SECS")? {
            config.worker.quota_retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env("SCRAWL_STUCK_THRESHOLD_SECS")? {
            config.monitor.stuck_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env("SCRAWL_METRIC_INTERVAL_SECS")? {
            config.monitor.metric_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env("SCRAWL_HEALTH_INTERVAL_SECS")? {
            config.monitor.health_interval = Duration::from_secs(secs);
        }
        if let Some(n) = read_env("SCRAWL_EVENT_BUFFER")? {
            config.event_buffer = n;
        }
        if let Some(hours) = read_env::<u64>("SCRAWL_RETENTION_HOURS")? {
            config.retention = Duration::from_secs(hours * 3600);
            config.monitor.retention = config.retention;
        }

        config.validate()?;
        Ok(config)
    }

    /// The documented defaults (alias of `Default`)
    pub fn default_values() -> Self {
        Self {
            data_dir: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            monitor: MonitorConfig::default(),
            event_buffer: 128,
            retention: Duration::from_secs(24 * 3600),
        }
    }

    /// Reject configurations the engine cannot run safely with
    pub fn validate(&self) -> PipelineResult<()> {
        if self.event_buffer == 0 {
            return Err(PipelineError::Validation(
                "event buffer must hold at least one event".to_string(),
            ));
        }
        for (job_type, slots) in &self.worker.concurrency {
            if *slots == 0 {
                return Err(PipelineError::Validation(format!(
                    "worker concurrency for {job_type} must be positive"
                )));
            }
        }
        if self.orchestrator.backoff.base_ms == 0
            || self.orchestrator.backoff.cap_ms < self.orchestrator.backoff.base_ms
        {
            return Err(PipelineError::Validation(
                "backoff base must be positive and at most the cap".to_string(),
            ));
        }
        // The lease must comfortably outlive the slowest stage
        let min_ttl = self.worker.max_stage_timeout().mul_f64(1.2);
        if self.queue.lease_ttl < min_ttl {
            return Err(PipelineError::Validation(format!(
                "lease ttl {}s is below 1.2x the largest stage timeout ({}s)",
                self.queue.lease_ttl.as_secs(),
                min_ttl.as_secs()
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_values()
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> PipelineResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|_| {
            PipelineError::Validation(format!("{key}={value} is not a valid value"))
        }),
        Err(_) => Ok(None),
    }
}
