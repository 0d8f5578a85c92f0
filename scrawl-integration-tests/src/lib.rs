//! Shared harness for the end-to-end scenarios
//!
//! Builds an engine over in-memory collaborators with optional
//! fault-injecting wrappers around the OCR and clustering providers, plus a
//! seeded three-image project.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use scrawl_connectors::{
    BlobStore, ClusterCandidate, ClusteringMethod, ClusteringProvider, ConnectorError,
    ConnectorResult, ImageId, MemoryBlobStore, MemoryProjectStore, Note, NoteImage, OcrOptions,
    OcrProvider, OcrResult, Project, ProjectId, UserId,
};
use scrawl_pipeline::stages::StageConnectors;
use scrawl_pipeline::{EngineConfig, PipelineEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const PROJECT: &str = "retro-board";
pub const USER: &str = "facilitator";

/// Three sticky-note fixtures yielding nine text blocks total
const STICKY_NOTES: [&str; 3] = [
    "onboarding flow confuses people\nonboarding needs fewer steps\nsignup drop off is high",
    "billing page crashes on submit\nbilling retries frustrate users\ninvoice emails arrive late",
    "support queue keeps growing\nsupport answers are slow\nhire more support staff",
];

/// OCR wrapper failing the first `failures` calls with a retryable timeout
pub struct FlakyOcr {
    inner: Arc<dyn OcrProvider>,
    remaining: Mutex<u32>,
}

impl FlakyOcr {
    pub fn new(inner: Arc<dyn OcrProvider>, failures: u32) -> Self {
        Self {
            inner,
            remaining: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl OcrProvider for FlakyOcr {
    async fn process(&self, image: &NoteImage, options: &OcrOptions) -> ConnectorResult<OcrResult> {
        {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectorError::Timeout("injected ocr timeout".to_string()));
            }
        }
        self.inner.process(image, options).await
    }
}

/// OCR wrapper that blocks until released
pub struct GatedOcr {
    inner: Arc<dyn OcrProvider>,
    gate: watch::Receiver<bool>,
}

impl GatedOcr {
    /// Returns the provider and the release handle
    pub fn new(inner: Arc<dyn OcrProvider>) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { inner, gate: rx }, tx)
    }
}

#[async_trait]
impl OcrProvider for GatedOcr {
    async fn process(&self, image: &NoteImage, options: &OcrOptions) -> ConnectorResult<OcrResult> {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        self.inner.process(image, options).await
    }
}

/// OCR wrapper that takes a fixed pause per image (cancellation window)
pub struct SlowOcr {
    inner: Arc<dyn OcrProvider>,
    pause: Duration,
}

impl SlowOcr {
    pub fn new(inner: Arc<dyn OcrProvider>, pause: Duration) -> Self {
        Self { inner, pause }
    }
}

#[async_trait]
impl OcrProvider for SlowOcr {
    async fn process(&self, image: &NoteImage, options: &OcrOptions) -> ConnectorResult<OcrResult> {
        tokio::time::sleep(self.pause).await;
        self.inner.process(image, options).await
    }
}

/// Clustering wrapper failing the first `failures` calls with invalid-input
pub struct RejectingClusterer {
    inner: Arc<dyn ClusteringProvider>,
    remaining: Mutex<u32>,
}

impl RejectingClusterer {
    pub fn new(inner: Arc<dyn ClusteringProvider>, failures: u32) -> Self {
        Self {
            inner,
            remaining: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl ClusteringProvider for RejectingClusterer {
    async fn cluster(
        &self,
        notes: &[Note],
        method: ClusteringMethod,
        target: usize,
    ) -> ConnectorResult<Vec<ClusterCandidate>> {
        {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectorError::InvalidInput(
                    "injected unusable cluster input".to_string(),
                ));
            }
        }
        self.inner.cluster(notes, method, target).await
    }
}

/// Engine plus seeded fixtures
pub struct Harness {
    pub engine: Arc<PipelineEngine>,
    pub store: Arc<MemoryProjectStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub project_id: ProjectId,
    pub user_id: UserId,
}

/// Fast-timing engine config for tests
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.heartbeat_interval = Duration::from_millis(20);
    config.worker.poll_interval = Duration::from_millis(20);
    config.orchestrator.backoff.base_ms = 10;
    config.orchestrator.backoff.cap_ms = 100;
    // Keep the monitor quiet unless a scenario spawns it deliberately
    config.monitor.metric_interval = Duration::from_secs(3600);
    config.monitor.health_interval = Duration::from_secs(3600);
    config
}

/// Build an engine over seeded fixtures, remapping connectors first
pub async fn start_harness(
    config: EngineConfig,
    remap: impl FnOnce(StageConnectors) -> StageConnectors,
) -> Harness {
    let (connectors, store, blobs) = StageConnectors::in_memory();
    let project_id = ProjectId::new(PROJECT);
    let user_id = UserId::new(USER);
    store
        .insert_project(Project::new(
            project_id.clone(),
            user_id.clone(),
            "Quarterly retro board",
        ))
        .await;
    for (index, body) in STICKY_NOTES.iter().enumerate() {
        let blob_key = format!("fixtures/sticky-{index}.png");
        BlobStore::put(blobs.as_ref(), &blob_key, body.as_bytes().to_vec())
            .await
            .unwrap_or_else(|e| panic!("seed blob: {e}"));
        store
            .insert_image(NoteImage {
                id: ImageId::new(),
                project_id: project_id.clone(),
                blob_key,
                content_type: "image/png".to_string(),
                uploaded_at: Utc::now(),
            })
            .await;
    }

    let connectors = remap(connectors);
    let engine = PipelineEngine::start(config, connectors)
        .await
        .unwrap_or_else(|e| panic!("engine start: {e}"));
    Harness {
        engine,
        store,
        blobs,
        project_id,
        user_id,
    }
}
