//! Durable processing workflow engine for handwritten-note digitization
//!
//! This crate provides the staged pipeline coordinating upload
//! verification, OCR, text cleaning, clustering, summary, and export:
//! - Durable job queue with priority, delay, retries, and leases
//! - Bounded worker pool dispatching to pluggable stage executors
//! - Per-workflow orchestration with checkpoints and rollback
//! - Progress bus fanning events out to workflow/project/user topics
//! - Monitor computing metrics, health, and stuck-workflow alerts

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

#[cfg(feature = "http")]
pub mod api;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod stages;
pub mod state;
pub mod worker;
pub mod workflow;

pub use bus::{Event, EventType, ProgressBus, Subscription, Topic};
pub use checkpoint::{Checkpoint, CheckpointId, RollbackAction, RollbackOp};
pub use config::EngineConfig;
pub use engine::PipelineEngine;
pub use error::{ErrorInfo, ErrorKind, PipelineError, PipelineResult};
pub use monitor::{
    Alert, AlertId, AlertType, HealthReport, HealthStatus, MetricsSnapshot, PipelineMonitor,
};
pub use orchestrator::{route_failure, FailureAction, PipelineOrchestrator};
pub use queue::job::{BackoffPolicy, EnqueueOptions, Job, JobId, JobPayload, JobState, JobType};
pub use queue::{JobQueue, JobUpdate, QueueConfig, QueueHealth};
pub use registry::WorkflowRegistry;
pub use stages::{StageConnectors, StageContext, StageExecutor, StageRegistry};
pub use state::StateStore;
pub use worker::{WorkerConfig, WorkerPool};
pub use workflow::{
    rollup_progress, Stage, Workflow, WorkflowConfig, WorkflowId, WorkflowStatus,
};
