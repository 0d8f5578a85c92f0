//! Stage executors
//!
//! One executor per job family. Executors are pure functions of their
//! payload plus idempotent keyed writes against the collaborators: a re-run
//! for the same workflow and stage converges to the same stored state.
//! Cancellation is cooperative through the context flag.

pub mod clean;
pub mod cluster;
pub mod export;
pub mod ocr;
pub mod summary;
pub mod verify;

use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use crate::workflow::WorkflowId;
use async_trait::async_trait;
use scrawl_connectors::{
    BlobStore, Cache, Cleaner, ClusteringProvider, ExportRenderer, FixtureOcr, LexicalClusterer,
    MemoryBlobStore, MemoryProjectStore, OcrProvider, ProjectStore, RuleCleaner, Summarizer,
    TextExportRenderer, ThemeSummarizer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// The collaborators executors run against
#[derive(Clone)]
pub struct StageConnectors {
    pub store: Arc<dyn ProjectStore>,
    pub ocr: Arc<dyn OcrProvider>,
    pub cleaner: Arc<dyn Cleaner>,
    pub clustering: Arc<dyn ClusteringProvider>,
    pub summarizer: Arc<dyn Summarizer>,
    pub exporter: Arc<dyn ExportRenderer>,
    pub blobs: Arc<dyn BlobStore>,
    pub cache: Arc<dyn Cache>,
}

impl StageConnectors {
    /// Fully in-memory set; used by tests and the demo
    pub fn in_memory() -> (Self, Arc<MemoryProjectStore>, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryProjectStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let connectors = Self {
            store: store.clone(),
            ocr: Arc::new(FixtureOcr::new(blobs.clone())),
            cleaner: Arc::new(RuleCleaner::new()),
            clustering: Arc::new(LexicalClusterer::new()),
            summarizer: Arc::new(ThemeSummarizer::new()),
            exporter: Arc::new(TextExportRenderer::new(blobs.clone())),
            blobs: blobs.clone(),
            cache: blobs.clone(),
        };
        (connectors, store, blobs)
    }
}

/// Per-job execution context handed to an executor
pub struct StageContext {
    pub workflow_id: WorkflowId,
    pub connectors: Arc<StageConnectors>,
    progress: watch::Sender<u8>,
    cancelled: Arc<AtomicBool>,
}

impl StageContext {
    /// Build a context plus the worker-side progress and cancel handles
    pub fn new(
        workflow_id: WorkflowId,
        connectors: Arc<StageConnectors>,
    ) -> (Self, watch::Receiver<u8>, Arc<AtomicBool>) {
        let (progress, progress_rx) = watch::channel(0);
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self {
                workflow_id,
                connectors,
                progress,
                cancelled: cancelled.clone(),
            },
            progress_rx,
            cancelled,
        )
    }

    /// Report stage-local progress, 0..=100
    pub fn report_progress(&self, progress: u8) {
        let _ = self.progress.send(progress.min(100));
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Yield point: surfaces cancellation as an error
    pub fn check_cancelled(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// A pluggable stage handler
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// The job family this executor serves
    fn job_type(&self) -> JobType;

    /// Run the stage; the returned value becomes the stage result blob
    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value>;
}

/// Executor lookup by job family
pub struct StageRegistry {
    executors: HashMap<JobType, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    /// Registry with the six standard executors
    pub fn standard() -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register(Arc::new(verify::VerifyExecutor));
        registry.register(Arc::new(ocr::OcrExecutor));
        registry.register(Arc::new(clean::CleanExecutor));
        registry.register(Arc::new(cluster::ClusterExecutor));
        registry.register(Arc::new(summary::SummaryExecutor));
        registry.register(Arc::new(export::ExportExecutor));
        registry
    }

    /// Add or replace an executor
    pub fn register(&mut self, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(executor.job_type(), executor);
    }

    /// Look up the executor for a job family
    pub fn get(&self, job_type: JobType) -> PipelineResult<Arc<dyn StageExecutor>> {
        self.executors
            .get(&job_type)
            .cloned()
            .ok_or_else(|| PipelineError::Internal(format!("no executor for {job_type}")))
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

pub(crate) fn payload_mismatch(expected: JobType, payload: &JobPayload) -> PipelineError {
    PipelineError::SchemaMismatch(format!(
        "{} executor received a {} payload",
        expected,
        payload.job_type()
    ))
}
