//! Durable job queue
//!
//! At-least-once delivery over a sled-persisted job table with an in-memory
//! working set. Workers lease jobs under a visibility timeout; a lease that
//! expires without a heartbeat returns the job to waiting with attempts
//! unchanged. Retries re-enter the tail of their priority class after a
//! full-jitter backoff delay.

pub mod job;

use crate::error::{ErrorInfo, PipelineError, PipelineResult};
use crate::state::StateStore;
use crate::workflow::WorkflowId;
use chrono::{Duration as ChronoDuration, Utc};
use job::{EnqueueOptions, Job, JobId, JobLease, JobPayload, JobState, JobType};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, info, warn};

/// Queue tuning knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Invisibility window granted per lease/heartbeat
    pub lease_ttl: Duration,
    /// Hard cap on serialized payload size; larger data goes by reference
    pub max_payload_bytes: usize,
    /// Capacity of the job-update broadcast channel
    pub update_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(360),
            max_payload_bytes: 64 * 1024,
            update_capacity: 256,
        }
    }
}

/// Change notification emitted on every job transition
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub workflow_id: WorkflowId,
    pub job_type: JobType,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

impl JobUpdate {
    fn of(job: &Job) -> Self {
        Self {
            job_id: job.id,
            workflow_id: job.workflow_id,
            job_type: job.job_type,
            state: job.state,
            progress: job.progress,
            attempts: job.attempts,
            result: job.result.clone(),
            error: job.error.clone(),
        }
    }
}

/// Counts by state plus the paused job families
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub cancelled: usize,
    pub paused: Vec<JobType>,
}

/// Reply to a heartbeat; carries the cooperative-cancel flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReply {
    pub cancel_requested: bool,
}

/// Durable FIFO-within-priority job queue
pub struct JobQueue {
    store: Arc<StateStore>,
    jobs: RwLock<HashMap<JobId, Job>>,
    paused: RwLock<HashSet<JobType>>,
    seq: AtomicU64,
    config: QueueConfig,
    updates_tx: broadcast::Sender<JobUpdate>,
    work_available: Notify,
}

impl JobQueue {
    /// Build the queue, reloading persisted jobs
    ///
    /// Jobs found active are returned to waiting with attempts unchanged:
    /// their worker died with the process that wrote them.
    pub fn new(store: Arc<StateStore>, config: QueueConfig) -> PipelineResult<Self> {
        let mut jobs = HashMap::new();
        let mut max_seq = 0u64;
        for mut job in store.jobs()? {
            if job.state == JobState::Active {
                warn!(job_id = %job.id, "returning orphaned active job to waiting");
                job.state = JobState::Waiting;
                job.lease = None;
                store.save_job(&job)?;
            }
            max_seq = max_seq.max(job.seq);
            jobs.insert(job.id, job);
        }
        if !jobs.is_empty() {
            info!(count = jobs.len(), "reloaded persisted jobs");
        }

        let (updates_tx, _) = broadcast::channel(config.update_capacity);
        Ok(Self {
            store,
            jobs: RwLock::new(jobs),
            paused: RwLock::new(HashSet::new()),
            seq: AtomicU64::new(max_seq + 1),
            config,
            updates_tx,
            work_available: Notify::new(),
        })
    }

    /// Subscribe to job transitions
    pub fn updates(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates_tx.subscribe()
    }

    /// Wait until new work may be available
    pub async fn notified(&self) {
        self.work_available.notified().await;
    }

    fn emit(&self, job: &Job) {
        // Fan-out is best-effort; a lagging receiver only loses queue
        // telemetry, never job state
        let _ = self.updates_tx.send(JobUpdate::of(job));
    }

    /// Enqueue a typed job
    pub async fn enqueue(
        &self,
        workflow_id: WorkflowId,
        payload: JobPayload,
        opts: EnqueueOptions,
    ) -> PipelineResult<JobId> {
        let payload_bytes = serde_json::to_vec(&payload)?;
        if payload_bytes.len() > self.config.max_payload_bytes {
            return Err(PipelineError::Validation(format!(
                "payload of {} bytes exceeds the {} byte cap",
                payload_bytes.len(),
                self.config.max_payload_bytes
            )));
        }

        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            job_type: payload.job_type(),
            workflow_id,
            payload,
            priority: opts.priority,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            attempts: 0,
            max_attempts: opts.max_attempts,
            backoff: opts.backoff,
            state: if opts.delay.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            progress: 0,
            result: None,
            error: None,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            delay_until: opts
                .delay
                .and_then(|d| ChronoDuration::from_std(d).ok())
                .map(|d| now + d),
            lease: None,
            cancel_requested: false,
        };

        self.store.save_job(&job)?;
        let id = job.id;
        counter!("scrawl_jobs_enqueued_total", "type" => job.job_type.as_str()).increment(1);
        debug!(job_id = %id, job_type = %job.job_type, workflow_id = %workflow_id, "job enqueued");
        self.emit(&job);
        self.jobs.write().await.insert(id, job);
        self.work_available.notify_waiters();
        Ok(id)
    }

    /// Lease at most one runnable job of the requested types
    ///
    /// Expired leases are reaped and elapsed delays promoted on the way in,
    /// then the best candidate is picked priority-descending, FIFO within a
    /// priority class.
    pub async fn lease(&self, types: &[JobType], worker_id: &str) -> PipelineResult<Option<Job>> {
        let now = Utc::now();
        let paused = self.paused.read().await.clone();
        let mut jobs = self.jobs.write().await;

        // Reap leases whose worker went quiet; attempts stay unchanged
        for job in jobs.values_mut() {
            if job.state == JobState::Active
                && job.lease.as_ref().is_some_and(|l| l.deadline < now)
            {
                warn!(job_id = %job.id, "lease expired, returning job to waiting");
                job.state = JobState::Waiting;
                job.lease = None;
                self.store.save_job(job)?;
                self.emit(job);
            }
            if job.state == JobState::Delayed
                && job.delay_until.is_some_and(|until| until <= now)
            {
                job.state = JobState::Waiting;
                job.delay_until = None;
                self.store.save_job(job)?;
                self.emit(job);
            }
        }

        let candidate = jobs
            .values()
            .filter(|j| {
                j.state == JobState::Waiting
                    && types.contains(&j.job_type)
                    && !paused.contains(&j.job_type)
            })
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.seq))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::Internal("candidate vanished".to_string()))?;
        job.state = JobState::Active;
        job.attempts += 1;
        job.started_at = Some(now);
        job.lease = Some(JobLease {
            worker_id: worker_id.to_string(),
            deadline: now
                + ChronoDuration::from_std(self.config.lease_ttl)
                    .unwrap_or_else(|_| ChronoDuration::seconds(360)),
        });
        self.store.save_job(job)?;
        counter!("scrawl_jobs_leased_total", "type" => job.job_type.as_str()).increment(1);
        debug!(job_id = %id, worker_id, attempt = job.attempts, "job leased");
        self.emit(job);
        Ok(Some(job.clone()))
    }

    fn owned_job<'a>(
        jobs: &'a mut HashMap<JobId, Job>,
        job_id: JobId,
        worker_id: &str,
    ) -> PipelineResult<&'a mut Job> {
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| PipelineError::NotFound(format!("job {job_id}")))?;
        let owned = job.state == JobState::Active
            && job
                .lease
                .as_ref()
                .is_some_and(|l| l.worker_id == worker_id);
        if !owned {
            return Err(PipelineError::StaleLease(job_id.to_string()));
        }
        Ok(job)
    }

    /// Extend a lease and optionally report progress
    pub async fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        progress: Option<u8>,
    ) -> PipelineResult<HeartbeatReply> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = Self::owned_job(&mut jobs, job_id, worker_id)?;
        if let Some(lease) = job.lease.as_mut() {
            lease.deadline = now
                + ChronoDuration::from_std(self.config.lease_ttl)
                    .unwrap_or_else(|_| ChronoDuration::seconds(360));
        }
        if let Some(p) = progress {
            let p = p.min(100);
            if p != job.progress {
                job.progress = p;
                self.store.save_job(job)?;
                self.emit(job);
            }
        }
        Ok(HeartbeatReply {
            cancel_requested: job.cancel_requested,
        })
    }

    /// Settle a job as completed
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> PipelineResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = Self::owned_job(&mut jobs, job_id, worker_id)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());
        job.lease = None;
        self.store.save_job(job)?;
        counter!("scrawl_jobs_completed_total", "type" => job.job_type.as_str()).increment(1);
        debug!(job_id = %job_id, "job completed");
        self.emit(job);
        Ok(())
    }

    /// Settle a job as failed, scheduling a retry when allowed
    ///
    /// `retry_after` overrides the backoff delay (used for quota pauses).
    pub async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: ErrorInfo,
        retry_after: Option<Duration>,
    ) -> PipelineResult<()> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = Self::owned_job(&mut jobs, job_id, worker_id)?;
        job.lease = None;
        job.error = Some(error.clone());

        if error.retryable && job.attempts < job.max_attempts && !job.cancel_requested {
            let delay = retry_after.unwrap_or_else(|| job.backoff.delay_for_attempt(job.attempts));
            job.state = JobState::Delayed;
            // Retries rejoin the tail of their priority class
            job.seq = self.seq.fetch_add(1, Ordering::SeqCst);
            job.delay_until =
                Some(now + ChronoDuration::from_std(delay).unwrap_or_else(|_| {
                    ChronoDuration::milliseconds(delay.as_millis() as i64)
                }));
            counter!("scrawl_jobs_retried_total", "type" => job.job_type.as_str()).increment(1);
            info!(
                job_id = %job_id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                kind = %error.kind,
                "job failed, retry scheduled"
            );
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            counter!("scrawl_jobs_failed_total", "type" => job.job_type.as_str()).increment(1);
            warn!(job_id = %job_id, attempts = job.attempts, kind = %error.kind, "job failed");
        }
        self.store.save_job(job)?;
        self.emit(job);
        self.work_available.notify_waiters();
        Ok(())
    }

    /// Settle a job as cancelled after a cooperative yield
    pub async fn yield_cancelled(&self, job_id: JobId, worker_id: &str) -> PipelineResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = Self::owned_job(&mut jobs, job_id, worker_id)?;
        job.state = JobState::Cancelled;
        job.finished_at = Some(Utc::now());
        job.lease = None;
        self.store.save_job(job)?;
        info!(job_id = %job_id, "job cancelled at yield point");
        self.emit(job);
        Ok(())
    }

    /// Request cancellation
    ///
    /// Waiting and delayed jobs cancel immediately; an active job gets a
    /// cancel-requested flag its worker observes on the next heartbeat.
    /// Settled jobs are unaffected.
    pub async fn cancel(&self, job_id: JobId) -> PipelineResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        match job.state {
            JobState::Waiting | JobState::Delayed => {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
                job.delay_until = None;
                self.store.save_job(job)?;
                self.emit(job);
                Ok(true)
            }
            JobState::Active => {
                job.cancel_requested = true;
                self.store.save_job(job)?;
                Ok(true)
            }
            JobState::Completed | JobState::Failed | JobState::Cancelled => Ok(false),
        }
    }

    /// Cancel every unsettled job of a workflow
    pub async fn cancel_for_workflow(&self, workflow_id: WorkflowId) -> PipelineResult<usize> {
        let ids: Vec<JobId> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|j| j.workflow_id == workflow_id && !j.state.is_terminal())
                .map(|j| j.id)
                .collect()
        };
        let mut cancelled = 0;
        for id in &ids {
            if self.cancel(*id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Look up a job
    pub async fn status(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Every job a workflow has enqueued, settled or not, oldest first
    pub async fn jobs_for_workflow(&self, workflow_id: WorkflowId) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.workflow_id == workflow_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// The unsettled job of a workflow, if any
    pub async fn job_for_workflow(&self, workflow_id: WorkflowId) -> Option<Job> {
        self.jobs
            .read()
            .await
            .values()
            .find(|j| j.workflow_id == workflow_id && !j.state.is_terminal())
            .cloned()
    }

    /// Counts by state
    pub async fn queue_health(&self) -> QueueHealth {
        let jobs = self.jobs.read().await;
        let mut health = QueueHealth::default();
        for job in jobs.values() {
            match job.state {
                JobState::Waiting => health.waiting += 1,
                JobState::Active => health.active += 1,
                JobState::Completed => health.completed += 1,
                JobState::Failed => health.failed += 1,
                JobState::Delayed => health.delayed += 1,
                JobState::Cancelled => health.cancelled += 1,
            }
        }
        let mut paused: Vec<JobType> = self.paused.read().await.iter().copied().collect();
        paused.sort();
        health.paused = paused;
        gauge!("scrawl_queue_depth").set((health.waiting + health.delayed) as f64);
        health
    }

    /// Stop leasing a job family
    pub async fn pause(&self, job_type: JobType) {
        self.paused.write().await.insert(job_type);
        info!(job_type = %job_type, "job family paused");
    }

    /// Resume a paused job family
    pub async fn resume(&self, job_type: JobType) {
        self.paused.write().await.remove(&job_type);
        info!(job_type = %job_type, "job family resumed");
        self.work_available.notify_waiters();
    }

    /// Drop settled jobs older than the cutoff; returns how many were removed
    pub async fn clean(
        &self,
        job_type: Option<JobType>,
        older_than: Duration,
    ) -> PipelineResult<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::hours(24));
        let mut jobs = self.jobs.write().await;
        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| {
                j.state.is_terminal()
                    && job_type.map_or(true, |t| j.job_type == t)
                    && j.finished_at.is_some_and(|at| at < cutoff)
            })
            .map(|j| j.id)
            .collect();
        for id in &stale {
            jobs.remove(id);
            self.store.delete_job(*id)?;
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use scrawl_connectors::ProjectId;

    fn queue() -> JobQueue {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        JobQueue::new(store, QueueConfig::default()).expect("build queue")
    }

    fn verify_payload() -> JobPayload {
        JobPayload::Verify {
            project_id: ProjectId::new("p1"),
        }
    }

    #[tokio::test]
    async fn test_lease_order_priority_then_fifo() {
        let queue = queue();
        let wf = WorkflowId::new();
        let low = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        let high = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default().with_priority(5))
            .await
            .expect("enqueue");
        let low2 = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        let order: Vec<JobId> = [
            queue.lease(&[JobType::Verify], "w1").await,
            queue.lease(&[JobType::Verify], "w1").await,
            queue.lease(&[JobType::Verify], "w1").await,
        ]
        .into_iter()
        .map(|r| r.expect("lease ok").expect("job present").id)
        .collect();
        assert_eq!(order, vec![high, low, low2]);
        assert!(queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_requires_lease_ownership() {
        let queue = queue();
        let wf = WorkflowId::new();
        queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        let job = queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .expect("job present");

        assert!(queue.heartbeat(job.id, "w1", Some(40)).await.is_ok());
        let err = queue
            .heartbeat(job.id, "intruder", Some(50))
            .await
            .expect_err("stale lease");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_retryable_failure_goes_delayed_then_failed() {
        let queue = queue();
        let wf = WorkflowId::new();
        let id = queue
            .enqueue(
                wf,
                verify_payload(),
                EnqueueOptions::default().with_max_attempts(2),
            )
            .await
            .expect("enqueue");

        // First attempt fails retryably
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        queue
            .fail(
                id,
                "w1",
                ErrorInfo::new(ErrorKind::Timeout, "slow"),
                Some(Duration::from_millis(1)),
            )
            .await
            .expect("fail records");
        let job = queue.status(id).await.expect("job present");
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.delay_until.is_some());

        // Delay elapses, second attempt fails and exhausts the budget
        tokio::time::sleep(Duration::from_millis(5)).await;
        let job = queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .expect("promoted after delay");
        assert_eq!(job.attempts, 2);
        queue
            .fail(id, "w1", ErrorInfo::new(ErrorKind::Timeout, "slow"), None)
            .await
            .expect("fail records");
        assert_eq!(
            queue.status(id).await.expect("job present").state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_retried_job_rejoins_tail_of_its_priority_class() {
        let queue = queue();
        let wf = WorkflowId::new();
        let first = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        queue
            .fail(
                first,
                "w1",
                ErrorInfo::new(ErrorKind::Timeout, "slow"),
                Some(Duration::from_millis(1)),
            )
            .await
            .expect("fail records");

        let second = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");

        tokio::time::sleep(Duration::from_millis(5)).await;
        let order: Vec<JobId> = [
            queue.lease(&[JobType::Verify], "w1").await,
            queue.lease(&[JobType::Verify], "w1").await,
        ]
        .into_iter()
        .map(|r| r.expect("lease ok").expect("job present").id)
        .collect();
        assert_eq!(order, vec![second, first]);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let queue = queue();
        let id = queue
            .enqueue(WorkflowId::new(), verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        queue
            .fail(id, "w1", ErrorInfo::new(ErrorKind::InvalidInput, "bad"), None)
            .await
            .expect("fail records");
        assert_eq!(
            queue.status(id).await.expect("job present").state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_zero_max_attempts_fails_immediately() {
        let queue = queue();
        let id = queue
            .enqueue(
                WorkflowId::new(),
                verify_payload(),
                EnqueueOptions::default().with_max_attempts(0),
            )
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        queue
            .fail(id, "w1", ErrorInfo::new(ErrorKind::Timeout, "slow"), None)
            .await
            .expect("fail records");
        assert_eq!(
            queue.status(id).await.expect("job present").state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_waiting_and_active() {
        let queue = queue();
        let wf = WorkflowId::new();
        let waiting = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        assert!(queue.cancel(waiting).await.expect("cancel"));
        assert_eq!(
            queue.status(waiting).await.expect("job present").state,
            JobState::Cancelled
        );

        let active = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        assert!(queue.cancel(active).await.expect("cancel"));
        // Active job keeps running until the worker observes the flag
        assert_eq!(
            queue.status(active).await.expect("job present").state,
            JobState::Active
        );
        let reply = queue
            .heartbeat(active, "w1", None)
            .await
            .expect("heartbeat ok");
        assert!(reply.cancel_requested);
        queue.yield_cancelled(active, "w1").await.expect("yield");
        assert_eq!(
            queue.status(active).await.expect("job present").state,
            JobState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_pause_blocks_lease_until_resume() {
        let queue = queue();
        queue
            .enqueue(WorkflowId::new(), verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.pause(JobType::Verify).await;
        assert!(queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .is_none());
        queue.resume(JobType::Verify).await;
        assert!(queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_returns_job_with_attempts_unchanged() {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let queue = JobQueue::new(
            store,
            QueueConfig {
                lease_ttl: Duration::from_millis(10),
                ..QueueConfig::default()
            },
        )
        .expect("build queue");
        let id = queue
            .enqueue(WorkflowId::new(), verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        let first = queue
            .lease(&[JobType::Verify], "w1")
            .await
            .expect("lease ok")
            .expect("job present");
        assert_eq!(first.attempts, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // A different worker picks it up after the visibility timeout
        let second = queue
            .lease(&[JobType::Verify], "w2")
            .await
            .expect("lease ok")
            .expect("job present");
        assert_eq!(second.id, id);
        assert_eq!(second.attempts, 2);

        // The original worker's settle is rejected
        let err = queue
            .complete(id, "w1", serde_json::json!({}))
            .await
            .expect_err("stale lease");
        assert!(matches!(err, PipelineError::StaleLease(_)));
    }

    #[tokio::test]
    async fn test_restart_recovers_jobs_from_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(StateStore::open(dir.path()).expect("open store"));
        let queue = JobQueue::new(store.clone(), QueueConfig::default()).expect("build queue");
        let wf = WorkflowId::new();
        let id = queue
            .enqueue(wf, verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        drop(queue);

        // New queue over the same store: the active job is back to waiting
        let queue = JobQueue::new(store, QueueConfig::default()).expect("build queue");
        let job = queue.status(id).await.expect("job present");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_clean_drops_old_settled_jobs() {
        let queue = queue();
        let id = queue
            .enqueue(WorkflowId::new(), verify_payload(), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue.lease(&[JobType::Verify], "w1").await.expect("lease ok");
        queue
            .complete(id, "w1", serde_json::json!({"ok": true}))
            .await
            .expect("complete");

        assert_eq!(
            queue
                .clean(None, Duration::from_secs(3600))
                .await
                .expect("clean"),
            0
        );
        assert_eq!(
            queue
                .clean(None, Duration::from_secs(0))
                .await
                .expect("clean"),
            1
        );
        assert!(queue.status(id).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let queue = JobQueue::new(
            store,
            QueueConfig {
                max_payload_bytes: 8,
                ..QueueConfig::default()
            },
        )
        .expect("build queue");
        let err = queue
            .enqueue(WorkflowId::new(), verify_payload(), EnqueueOptions::default())
            .await
            .expect_err("payload too large");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
