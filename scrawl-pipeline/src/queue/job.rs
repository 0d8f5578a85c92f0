//! Job rows, payloads, and backoff policy

use crate::error::ErrorInfo;
use crate::workflow::{Stage, WorkflowId};
use chrono::{DateTime, Utc};
use scrawl_connectors::{CleaningOptions, ClusteringMethod, ExportFormat, ProjectId, SummaryOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create new job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed job families, one per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Verify,
    Ocr,
    Clean,
    Cluster,
    Summary,
    Export,
}

impl JobType {
    /// All job types
    pub const ALL: [JobType; 6] = [
        JobType::Verify,
        JobType::Ocr,
        JobType::Clean,
        JobType::Cluster,
        JobType::Summary,
        JobType::Export,
    ];

    /// The job family executing a given work stage
    pub fn for_stage(stage: Stage) -> Option<JobType> {
        match stage {
            Stage::Upload => Some(JobType::Verify),
            Stage::Ocr => Some(JobType::Ocr),
            Stage::Clean => Some(JobType::Clean),
            Stage::Cluster => Some(JobType::Cluster),
            Stage::Summary => Some(JobType::Summary),
            Stage::Export => Some(JobType::Export),
            Stage::Completed => None,
        }
    }

    /// The stage this job family executes
    pub fn stage(&self) -> Stage {
        match self {
            JobType::Verify => Stage::Upload,
            JobType::Ocr => Stage::Ocr,
            JobType::Clean => Stage::Clean,
            JobType::Cluster => Stage::Cluster,
            JobType::Summary => Stage::Summary,
            JobType::Export => Stage::Export,
        }
    }

    /// Wire spelling of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Verify => "verify",
            JobType::Ocr => "ocr",
            JobType::Clean => "clean",
            JobType::Cluster => "cluster",
            JobType::Summary => "summary",
            JobType::Export => "export",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed payload per stage
///
/// Payloads stay small; bulk data lives in the project store and is passed
/// by reference through the project id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobPayload {
    Verify {
        project_id: ProjectId,
    },
    Ocr {
        project_id: ProjectId,
    },
    Clean {
        project_id: ProjectId,
        options: CleaningOptions,
    },
    Cluster {
        project_id: ProjectId,
        method: ClusteringMethod,
        target_clusters: Option<usize>,
    },
    Summary {
        project_id: ProjectId,
        options: SummaryOptions,
    },
    Export {
        project_id: ProjectId,
        formats: Vec<ExportFormat>,
    },
}

impl JobPayload {
    /// The project this payload addresses
    pub fn project_id(&self) -> &ProjectId {
        match self {
            JobPayload::Verify { project_id }
            | JobPayload::Ocr { project_id }
            | JobPayload::Clean { project_id, .. }
            | JobPayload::Cluster { project_id, .. }
            | JobPayload::Summary { project_id, .. }
            | JobPayload::Export { project_id, .. } => project_id,
        }
    }

    /// The job family this payload belongs to
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Verify { .. } => JobType::Verify,
            JobPayload::Ocr { .. } => JobType::Ocr,
            JobPayload::Clean { .. } => JobType::Clean,
            JobPayload::Cluster { .. } => JobType::Cluster,
            JobPayload::Summary { .. } => JobType::Summary,
            JobPayload::Export { .. } => JobType::Export,
        }
    }
}

/// Full-jitter exponential backoff
///
/// Next delay is uniformly sampled in `(0, min(cap, base * 2^attempts)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Sample the delay before retry number `attempts`
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        // Clamp the exponent so the shift cannot overflow
        let exp = attempts.min(16);
        let ceiling = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        let jittered = (ceiling as f64 * fastrand::f64()) as u64;
        Duration::from_millis(jittered.max(1))
    }
}

/// Options accepted by `enqueue`
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    /// Higher runs first within a type
    pub priority: i32,
    /// Initial visibility delay
    pub delay: Option<Duration>,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EnqueueOptions {
    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the maximum attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set an initial delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Cancelled,
}

impl JobState {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Worker lease on an active job (visibility timeout model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLease {
    pub worker_id: String,
    pub deadline: DateTime<Utc>,
}

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub workflow_id: WorkflowId,
    pub payload: JobPayload,
    pub priority: i32,
    /// Enqueue order within the queue; ties FIFO within a priority class
    pub seq: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub delay_until: Option<DateTime<Utc>>,
    pub lease: Option<JobLease>,
    pub cancel_requested: bool,
}
