//! Worker pool
//!
//! Cooperative workers with bounded per-type concurrency. Each worker loops
//! lease, dispatch to the stage executor, heartbeat progress, settle. A job
//! exceeding its per-type timeout fails retryably; a cancel flag observed on
//! heartbeat is relayed to the executor, which yields at its next check.

use crate::error::{ErrorInfo, ErrorKind, PipelineError};
use crate::queue::job::{Job, JobType};
use crate::queue::JobQueue;
use crate::stages::{StageConnectors, StageContext, StageRegistry};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Worker pool tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent workers per job family
    pub concurrency: BTreeMap<JobType, usize>,
    /// Per-family job timeout
    pub stage_timeouts: BTreeMap<JobType, Duration>,
    pub heartbeat_interval: Duration,
    /// Idle poll fallback when no enqueue notification arrives
    pub poll_interval: Duration,
    /// Fixed retry delay applied to quota-exceeded failures
    pub quota_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: BTreeMap::from([
                (JobType::Verify, 4),
                (JobType::Ocr, 4),
                (JobType::Clean, 8),
                (JobType::Cluster, 2),
                (JobType::Summary, 2),
                (JobType::Export, 2),
            ]),
            stage_timeouts: BTreeMap::from([
                (JobType::Verify, Duration::from_secs(60)),
                (JobType::Ocr, Duration::from_secs(300)),
                (JobType::Clean, Duration::from_secs(120)),
                (JobType::Cluster, Duration::from_secs(300)),
                (JobType::Summary, Duration::from_secs(180)),
                (JobType::Export, Duration::from_secs(300)),
            ]),
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(250),
            quota_retry_delay: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// The largest configured stage timeout
    pub fn max_stage_timeout(&self) -> Duration {
        self.stage_timeouts
            .values()
            .copied()
            .max()
            .unwrap_or(Duration::from_secs(300))
    }
}

/// Bounded pool of stage workers
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    executors: Arc<StageRegistry>,
    connectors: Arc<StageConnectors>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create the pool; call `spawn` to start the workers
    pub fn new(
        queue: Arc<JobQueue>,
        executors: Arc<StageRegistry>,
        connectors: Arc<StageConnectors>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            executors,
            connectors,
            config,
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start one worker task per configured slot
    pub fn spawn(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for (&job_type, &slots) in &self.config.concurrency {
            for slot in 0..slots {
                let pool = Arc::clone(self);
                let worker_id = format!("worker-{job_type}-{slot}");
                let shutdown_rx = self.shutdown_tx.subscribe();
                handles.push(tokio::spawn(async move {
                    pool.worker_loop(job_type, worker_id, shutdown_rx).await;
                }));
            }
        }
    }

    /// Stop accepting work and wait for in-flight jobs to settle
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(%err, "worker task panicked");
            }
        }
    }

    async fn worker_loop(
        &self,
        job_type: JobType,
        worker_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.lease(&[job_type], &worker_id).await {
                Ok(Some(job)) => self.run_job(job, &worker_id).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.queue.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    // Backend hiccup; retry under our own cadence
                    warn!(worker_id, %err, "lease failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    async fn run_job(&self, job: Job, worker_id: &str) {
        let executor = match self.executors.get(job.job_type) {
            Ok(executor) => executor,
            Err(err) => {
                let _ = self
                    .queue
                    .fail(job.id, worker_id, ErrorInfo::from(&err), None)
                    .await;
                return;
            }
        };

        let (ctx, mut progress_rx, cancel_flag) =
            StageContext::new(job.workflow_id, self.connectors.clone());
        if job.cancel_requested {
            cancel_flag.store(true, Ordering::Release);
        }

        let timeout = self
            .config
            .stage_timeouts
            .get(&job.job_type)
            .copied()
            .unwrap_or_else(|| Duration::from_secs(300));
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset(); // skip the immediate first tick
        let execution = executor.execute(&ctx, &job.payload);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = &mut deadline => {
                    break Err(PipelineError::Timeout(format!(
                        "{} job exceeded {}s",
                        job.job_type,
                        timeout.as_secs()
                    )));
                }
                _ = heartbeat.tick() => {
                    let progress = *progress_rx.borrow_and_update();
                    match self.queue.heartbeat(job.id, worker_id, Some(progress)).await {
                        Ok(reply) => {
                            if reply.cancel_requested {
                                cancel_flag.store(true, Ordering::Release);
                            }
                        }
                        Err(err) => {
                            // Lease lost: someone else owns the job now
                            break Err(err);
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(result) => {
                if let Err(err) = self.queue.complete(job.id, worker_id, result).await {
                    warn!(job_id = %job.id, %err, "completion not recorded");
                }
            }
            Err(PipelineError::Cancelled) => {
                if let Err(err) = self.queue.yield_cancelled(job.id, worker_id).await {
                    warn!(job_id = %job.id, %err, "cancel yield not recorded");
                }
            }
            Err(PipelineError::StaleLease(_)) => {
                warn!(job_id = %job.id, worker_id, "abandoning job after lost lease");
            }
            Err(err) => {
                let retry_after = (err.kind() == ErrorKind::QuotaExceeded)
                    .then_some(self.config.quota_retry_delay);
                if let Err(settle_err) = self
                    .queue
                    .fail(job.id, worker_id, ErrorInfo::from(&err), retry_after)
                    .await
                {
                    warn!(job_id = %job.id, %settle_err, "failure not recorded");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::queue::job::{EnqueueOptions, JobPayload, JobState};
    use crate::queue::QueueConfig;
    use crate::stages::StageExecutor;
    use crate::state::StateStore;
    use crate::workflow::WorkflowId;
    use async_trait::async_trait;
    use chrono::Utc;
    use scrawl_connectors::{ImageId, NoteImage, Project, ProjectId, UserId};

    async fn wait_for_state(queue: &JobQueue, id: crate::queue::job::JobId, state: JobState) {
        for _ in 0..200 {
            if queue.status(id).await.is_some_and(|j| j.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached {state:?}");
    }

    async fn seeded_pool(config: WorkerConfig) -> (Arc<WorkerPool>, Arc<JobQueue>) {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let queue = Arc::new(JobQueue::new(store, QueueConfig::default()).expect("build queue"));
        let (connectors, project_store, blobs) = StageConnectors::in_memory();
        project_store
            .insert_project(Project::new(ProjectId::new("p1"), UserId::new("u1"), "retro"))
            .await;
        scrawl_connectors::BlobStore::put(blobs.as_ref(), "img-1", b"alpha beta\n".to_vec())
            .await
            .expect("seed blob");
        project_store
            .insert_image(NoteImage {
                id: ImageId::new(),
                project_id: ProjectId::new("p1"),
                blob_key: "img-1".to_string(),
                content_type: "image/png".to_string(),
                uploaded_at: Utc::now(),
            })
            .await;
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(StageRegistry::standard()),
            Arc::new(connectors),
            config,
        ));
        pool.spawn();
        (pool, queue)
    }

    #[tokio::test]
    async fn test_worker_runs_leased_job_to_completion() {
        let (pool, queue) = seeded_pool(WorkerConfig::default()).await;
        let id = queue
            .enqueue(
                WorkflowId::new(),
                JobPayload::Verify {
                    project_id: ProjectId::new("p1"),
                },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");

        wait_for_state(&queue, id, JobState::Completed).await;
        let job = queue.status(id).await.expect("job present");
        assert_eq!(job.result.as_ref().expect("result")["imageCount"], 1);
        pool.shutdown().await;
    }

    /// Executor that loops until cancelled
    struct StallingExecutor;

    #[async_trait]
    impl StageExecutor for StallingExecutor {
        fn job_type(&self) -> JobType {
            JobType::Verify
        }

        async fn execute(
            &self,
            ctx: &StageContext,
            _payload: &JobPayload,
        ) -> PipelineResult<serde_json::Value> {
            loop {
                ctx.check_cancelled()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_executor_and_settles_cancelled() {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let queue = Arc::new(JobQueue::new(store, QueueConfig::default()).expect("build queue"));
        let (connectors, _project_store, _blobs) = StageConnectors::in_memory();
        let mut registry = StageRegistry::standard();
        registry.register(Arc::new(StallingExecutor));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(registry),
            Arc::new(connectors),
            WorkerConfig {
                heartbeat_interval: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        ));
        pool.spawn();

        let id = queue
            .enqueue(
                WorkflowId::new(),
                JobPayload::Verify {
                    project_id: ProjectId::new("p1"),
                },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        wait_for_state(&queue, id, JobState::Active).await;

        queue.cancel(id).await.expect("cancel");
        wait_for_state(&queue, id, JobState::Cancelled).await;
        pool.shutdown().await;
    }

    /// Executor that never yields progress and never finishes
    struct FrozenExecutor;

    #[async_trait]
    impl StageExecutor for FrozenExecutor {
        fn job_type(&self) -> JobType {
            JobType::Verify
        }

        async fn execute(
            &self,
            _ctx: &StageContext,
            _payload: &JobPayload,
        ) -> PipelineResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test]
    async fn test_job_timeout_fails_retryably() {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let queue = Arc::new(JobQueue::new(store, QueueConfig::default()).expect("build queue"));
        let (connectors, _project_store, _blobs) = StageConnectors::in_memory();
        let mut registry = StageRegistry::standard();
        registry.register(Arc::new(FrozenExecutor));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(registry),
            Arc::new(connectors),
            WorkerConfig {
                stage_timeouts: BTreeMap::from([(JobType::Verify, Duration::from_millis(50))]),
                heartbeat_interval: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        ));
        pool.spawn();

        let id = queue
            .enqueue(
                WorkflowId::new(),
                JobPayload::Verify {
                    project_id: ProjectId::new("p1"),
                },
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .expect("enqueue");

        wait_for_state(&queue, id, JobState::Failed).await;
        let job = queue.status(id).await.expect("job present");
        assert_eq!(job.error.as_ref().expect("error").kind, ErrorKind::Timeout);
        pool.shutdown().await;
    }
}
