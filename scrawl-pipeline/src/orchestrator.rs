//! Workflow orchestrator
//!
//! One driver task per workflow walks the stage sequence as a linear state
//! machine: checkpoint, enqueue, observe job settlement, advance or route
//! the failure. The failure router is the only place an error kind becomes
//! a retry, rollback, or terminal decision. Exactly one stage job is in
//! flight per workflow.

use crate::checkpoint::{apply_rollback_actions, Checkpoint};
use crate::error::{ErrorInfo, ErrorKind, PipelineError, PipelineResult};
use crate::monitor::WorkflowValidator;
use crate::queue::job::{BackoffPolicy, EnqueueOptions, JobId, JobPayload, JobState};
use crate::queue::{JobQueue, JobUpdate};
use crate::registry::WorkflowRegistry;
use crate::state::StateStore;
use crate::workflow::{Stage, Workflow, WorkflowConfig, WorkflowId, WorkflowStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use scrawl_connectors::{ProjectId, ProjectStatus, ProjectStore, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Orchestrator tuning knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempt budget per stage job
    pub max_attempts: u32,
    /// Backoff applied to stage job retries
    pub backoff: BackoffPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Decision of the failure router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Queue-level retry of the same stage (backoff already applied)
    RetrySameStage,
    /// Undo the previous stage and re-run it
    RollbackToPrevious,
    /// Promote the workflow to failed
    Terminal,
}

/// Deterministic mapping from failure context to action
///
/// `attempts` is what the job has consumed, `rollbacks` what the workflow
/// has already spent; a recoverable kind rolls back once per workflow.
pub fn route_failure(
    kind: ErrorKind,
    stage: Stage,
    attempts: u32,
    max_attempts: u32,
    rollbacks: u32,
) -> FailureAction {
    match kind {
        ErrorKind::Timeout
        | ErrorKind::RateLimited
        | ErrorKind::QuotaExceeded
        | ErrorKind::UpstreamUnavailable
        | ErrorKind::Network => {
            if attempts < max_attempts {
                FailureAction::RetrySameStage
            } else {
                FailureAction::Terminal
            }
        }
        ErrorKind::InvalidInput | ErrorKind::SchemaMismatch => {
            if stage.prev().is_some() && rollbacks == 0 {
                FailureAction::RollbackToPrevious
            } else {
                FailureAction::Terminal
            }
        }
        ErrorKind::NoInput
        | ErrorKind::NotFound
        | ErrorKind::NotAuthorized
        | ErrorKind::Validation
        | ErrorKind::Conflict
        | ErrorKind::Internal => FailureAction::Terminal,
    }
}

enum Settled {
    Completed(serde_json::Value),
    Failed(ErrorInfo, u32),
    Cancelled,
}

/// Per-workflow pipeline driver and control surface
pub struct PipelineOrchestrator {
    store: Arc<StateStore>,
    registry: Arc<WorkflowRegistry>,
    queue: Arc<JobQueue>,
    projects: Arc<dyn ProjectStore>,
    config: OrchestratorConfig,
    drivers: Mutex<HashMap<WorkflowId, JoinHandle<()>>>,
}

impl PipelineOrchestrator {
    /// Create the orchestrator
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<WorkflowRegistry>,
        queue: Arc<JobQueue>,
        projects: Arc<dyn ProjectStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            projects,
            config,
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and start a workflow over a project
    ///
    /// Fails before any enqueue: unknown project, foreign project, a
    /// workflow already running for the project, or a project with no
    /// images.
    pub async fn start_workflow(
        self: &Arc<Self>,
        user_id: UserId,
        project_id: ProjectId,
        config: WorkflowConfig,
    ) -> PipelineResult<WorkflowId> {
        let project = self.projects.project(&project_id).await?;
        if project.owner != user_id {
            return Err(PipelineError::NotAuthorized(format!(
                "project {project_id} belongs to another user"
            )));
        }
        if self.registry.active_for_project(&project_id).is_some() {
            return Err(PipelineError::Conflict(format!(
                "project {project_id} is already processing"
            )));
        }
        let images = self.projects.images(&project_id).await?;
        if images.is_empty() {
            return Err(PipelineError::NoInput(format!(
                "project {project_id} has no images"
            )));
        }

        let workflow = Workflow::new(project_id.clone(), user_id, config);
        let id = workflow.id;
        self.registry.insert(workflow)?;
        self.projects
            .update_project_status(&project_id, ProjectStatus::Processing)
            .await?;
        self.spawn_driver(id);
        info!(workflow_id = %id, project_id = %project_id, "workflow started");
        Ok(id)
    }

    /// Fetch a workflow the requester owns
    pub fn get_workflow(&self, id: WorkflowId, requester: &UserId) -> PipelineResult<Workflow> {
        let workflow = self.registry.get(id)?;
        if workflow.user_id != *requester {
            return Err(PipelineError::NotAuthorized(format!(
                "workflow {id} belongs to another user"
            )));
        }
        Ok(workflow)
    }

    /// Request cancellation; returns whether intent was recorded
    pub async fn cancel_workflow(&self, id: WorkflowId) -> PipelineResult<bool> {
        if !self.registry.request_cancel(id)? {
            return Ok(false);
        }
        // Flag the in-flight job so its executor yields; waiting and
        // delayed jobs settle immediately
        self.queue.cancel_for_workflow(id).await?;
        info!(workflow_id = %id, "cancellation requested");
        Ok(true)
    }

    /// Start a fresh workflow from a failed one's configuration
    pub async fn restart_failed_workflow(
        self: &Arc<Self>,
        id: WorkflowId,
        requester: &UserId,
    ) -> PipelineResult<WorkflowId> {
        let workflow = self.get_workflow(id, requester)?;
        if workflow.status != WorkflowStatus::Failed {
            return Err(PipelineError::Conflict(format!(
                "workflow {id} is {}, only failed workflows restart",
                workflow.status
            )));
        }
        self.start_workflow(workflow.user_id, workflow.project_id, workflow.config)
            .await
    }

    /// Workflows owned by a user
    pub fn list_user_workflows(&self, user_id: &UserId) -> Vec<Workflow> {
        self.registry.list_user(user_id)
    }

    /// Workflows over a project
    pub fn list_project_workflows(&self, project_id: &ProjectId) -> Vec<Workflow> {
        self.registry.list_project(project_id)
    }

    /// Finalize workflows interrupted by a process restart
    ///
    /// Durable records let us spot them; their jobs are cancelled and the
    /// workflow lands in failed so the operator can restart it.
    pub async fn recover(&self) -> PipelineResult<Vec<WorkflowId>> {
        let mut recovered = Vec::new();
        for workflow in self.registry.all() {
            if workflow.status.is_terminal() {
                continue;
            }
            warn!(workflow_id = %workflow.id, stage = %workflow.current_stage, "finalizing workflow interrupted by restart");
            self.queue.cancel_for_workflow(workflow.id).await?;
            self.registry.finalize(
                workflow.id,
                WorkflowStatus::Failed,
                Some(ErrorInfo::new(
                    ErrorKind::Internal,
                    format!(
                        "processing interrupted by restart during the {} stage",
                        workflow.current_stage
                    ),
                )),
            )?;
            if let Err(err) = self
                .projects
                .update_project_status(&workflow.project_id, ProjectStatus::Failed)
                .await
            {
                // The project store may not know this project anymore
                warn!(project_id = %workflow.project_id, %err, "project status not updated during recovery");
            }
            recovered.push(workflow.id);
        }
        Ok(recovered)
    }

    /// Abort all driver tasks (state recovers on next start)
    pub fn shutdown(&self) {
        for (_, handle) in self.drivers.lock().drain() {
            handle.abort();
        }
    }

    fn spawn_driver(self: &Arc<Self>, id: WorkflowId) {
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            orchestrator.drive(id).await;
            orchestrator.drivers.lock().remove(&id);
        });
        self.drivers.lock().insert(id, handle);
    }

    async fn drive(&self, id: WorkflowId) {
        if let Err(err) = self.drive_inner(id).await {
            error!(workflow_id = %id, %err, "workflow driver failed");
            let info = ErrorInfo::from(&err);
            if let Ok(workflow) = self.registry.get(id) {
                if !workflow.status.is_terminal() {
                    let _ = self
                        .registry
                        .finalize(id, WorkflowStatus::Failed, Some(info));
                    let _ = self
                        .projects
                        .update_project_status(&workflow.project_id, ProjectStatus::Failed)
                        .await;
                }
            }
        }
    }

    async fn drive_inner(&self, id: WorkflowId) -> PipelineResult<()> {
        let mut seq = self
            .store
            .checkpoints(id)?
            .last()
            .map(|c| c.seq + 1)
            .unwrap_or(0);
        let mut stage = self.registry.get(id)?.current_stage;

        loop {
            let workflow = self.registry.get(id)?;
            if workflow.status.is_terminal() {
                return Ok(());
            }
            if workflow.cancel_requested {
                self.finalize_cancelled(&workflow).await?;
                return Ok(());
            }

            // 1. Checkpoint ahead of the stage
            let mut checkpoint = Checkpoint::capture(
                self.projects.as_ref(),
                id,
                stage,
                seq,
                &workflow.project_id,
            )
            .await?;
            seq += 1;
            self.store.save_checkpoint(&checkpoint)?;

            // 2. Enqueue, subscribing first so no settle event is missed
            let mut updates = self.queue.updates();
            let payload = Self::payload_for(stage, &workflow)?;
            let job_id = self
                .queue
                .enqueue(
                    id,
                    payload,
                    EnqueueOptions {
                        backoff: self.config.backoff,
                        ..EnqueueOptions::default()
                    }
                    .with_max_attempts(self.config.max_attempts),
                )
                .await?;
            self.registry.mark_stage_started(id, stage)?;

            // 3. Observe until the job settles
            match self.observe(id, job_id, stage, &mut updates).await? {
                Settled::Completed(result) => {
                    let current = self.projects.capture(&workflow.project_id).await?;
                    checkpoint.record_created(&current);
                    self.store.save_checkpoint(&checkpoint)?;
                    self.registry.record_stage_completed(id, stage, result)?;

                    match stage.next() {
                        Some(Stage::Completed) | None => {
                            self.registry
                                .finalize(id, WorkflowStatus::Completed, None)?;
                            self.projects
                                .update_project_status(
                                    &workflow.project_id,
                                    ProjectStatus::Completed,
                                )
                                .await?;
                            info!(workflow_id = %id, "workflow completed");
                            return Ok(());
                        }
                        Some(next) => stage = next,
                    }
                }
                Settled::Failed(error, attempts) => {
                    let workflow = self.registry.get(id)?;
                    match route_failure(
                        error.kind,
                        stage,
                        attempts,
                        self.config.max_attempts,
                        workflow.rollback_count,
                    ) {
                        FailureAction::RollbackToPrevious => {
                            let target = stage.prev().ok_or_else(|| {
                                PipelineError::Internal(format!(
                                    "no stage precedes {stage} to roll back to"
                                ))
                            })?;
                            self.perform_rollback(id, target, &error).await?;
                            stage = target;
                        }
                        // Retries already happened inside the queue; by the
                        // time a job reports failed the budget is spent
                        FailureAction::RetrySameStage | FailureAction::Terminal => {
                            self.registry
                                .finalize(id, WorkflowStatus::Failed, Some(error))?;
                            self.projects
                                .update_project_status(&workflow.project_id, ProjectStatus::Failed)
                                .await?;
                            return Ok(());
                        }
                    }
                }
                Settled::Cancelled => {
                    let workflow = self.registry.get(id)?;
                    self.finalize_cancelled(&workflow).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn observe(
        &self,
        workflow_id: WorkflowId,
        job_id: JobId,
        stage: Stage,
        updates: &mut broadcast::Receiver<JobUpdate>,
    ) -> PipelineResult<Settled> {
        loop {
            let update = match updates.recv().await {
                Ok(update) => update,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(workflow_id = %workflow_id, skipped, "job updates lagged, resyncing");
                    // Fall back to the job row to avoid missing the settle
                    let job = self.queue.status(job_id).await.ok_or_else(|| {
                        PipelineError::Internal(format!("job {job_id} vanished"))
                    })?;
                    JobUpdate {
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
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(PipelineError::Internal(
                        "job update channel closed".to_string(),
                    ));
                }
            };
            if update.job_id != job_id {
                continue;
            }
            match update.state {
                JobState::Active => {
                    self.registry
                        .record_job_progress(workflow_id, stage, update.progress)?;
                }
                JobState::Completed => {
                    return Ok(Settled::Completed(
                        update.result.unwrap_or(serde_json::Value::Null),
                    ));
                }
                JobState::Failed => {
                    let error = update.error.unwrap_or_else(|| {
                        ErrorInfo::new(ErrorKind::Internal, "job failed without error detail")
                    });
                    return Ok(Settled::Failed(error, update.attempts));
                }
                JobState::Cancelled => return Ok(Settled::Cancelled),
                JobState::Waiting | JobState::Delayed => {}
            }
        }
    }

    /// Roll back to the checkpoint of `target`, undoing everything newer
    async fn perform_rollback(
        &self,
        id: WorkflowId,
        target: Stage,
        original: &ErrorInfo,
    ) -> PipelineResult<()> {
        let result = self.rollback_inner(id, target).await;
        if let Err(rollback_err) = result {
            // A failed rollback is unrecoverable; surface both causes
            return Err(PipelineError::Internal(format!(
                "original: {}; rollback: {}",
                original.detail, rollback_err
            )));
        }
        self.registry.record_rollback(
            id,
            target,
            format!("{}: rolled back to {}", original.kind, target),
        )?;
        info!(workflow_id = %id, target = %target, "rollback complete");
        Ok(())
    }

    async fn rollback_inner(&self, id: WorkflowId, target: Stage) -> PipelineResult<()> {
        let checkpoints = self.store.checkpoints(id)?;
        let anchor = checkpoints
            .iter()
            .rev()
            .find(|c| c.stage == target)
            .ok_or_else(|| {
                PipelineError::Internal(format!("no checkpoint recorded for stage {target}"))
            })?;

        // Inverse actions from checkpoints newer than the anchor, newest
        // checkpoint first, each list applied in reverse
        for checkpoint in checkpoints.iter().rev().filter(|c| c.seq > anchor.seq) {
            apply_rollback_actions(self.projects.as_ref(), &checkpoint.rollback_actions).await?;
        }
        self.projects
            .restore(anchor.project_snapshot.clone())
            .await?;
        self.store.delete_checkpoints_after(id, anchor.seq)?;
        Ok(())
    }

    async fn finalize_cancelled(&self, workflow: &Workflow) -> PipelineResult<()> {
        self.queue.cancel_for_workflow(workflow.id).await?;
        self.registry
            .finalize(workflow.id, WorkflowStatus::Cancelled, None)?;
        // The project goes back to editable
        self.projects
            .update_project_status(&workflow.project_id, ProjectStatus::Draft)
            .await?;
        info!(workflow_id = %workflow.id, "workflow cancelled");
        Ok(())
    }

    fn payload_for(stage: Stage, workflow: &Workflow) -> PipelineResult<JobPayload> {
        let project_id = workflow.project_id.clone();
        Ok(match stage {
            Stage::Upload => JobPayload::Verify { project_id },
            Stage::Ocr => JobPayload::Ocr { project_id },
            Stage::Clean => JobPayload::Clean {
                project_id,
                options: workflow.config.cleaning_options,
            },
            Stage::Cluster => JobPayload::Cluster {
                project_id,
                method: workflow.config.clustering_method,
                target_clusters: workflow.config.target_clusters,
            },
            Stage::Summary => JobPayload::Summary {
                project_id,
                options: workflow.config.summary_options.clone(),
            },
            Stage::Export => JobPayload::Export {
                project_id,
                formats: workflow.config.export_formats.clone(),
            },
            Stage::Completed => {
                return Err(PipelineError::Internal(
                    "completed is not an executable stage".to_string(),
                ))
            }
        })
    }
}

#[async_trait]
impl WorkflowValidator for PipelineOrchestrator {
    /// Consistency probe used by the monitor's stuck detection
    ///
    /// A running workflow is consistent while it has an unsettled job or a
    /// live driver; anything else lost its driver and is finalized.
    async fn validate_workflow(&self, id: WorkflowId) -> PipelineResult<bool> {
        let workflow = self.registry.get(id)?;
        if workflow.status != WorkflowStatus::Running {
            return Ok(true);
        }
        if self.queue.job_for_workflow(id).await.is_some() {
            return Ok(true);
        }
        if self.drivers.lock().contains_key(&id) {
            return Ok(true);
        }
        warn!(workflow_id = %id, "running workflow has no job and no driver, failing it");
        self.registry.finalize(
            id,
            WorkflowStatus::Failed,
            Some(ErrorInfo::new(
                ErrorKind::Internal,
                "workflow lost its driver",
            )),
        )?;
        self.projects
            .update_project_status(&workflow.project_id, ProjectStatus::Failed)
            .await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_retryable_kinds_respect_attempt_budget() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
            ErrorKind::QuotaExceeded,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::Network,
        ] {
            assert_eq!(
                route_failure(kind, Stage::Ocr, 1, 3, 0),
                FailureAction::RetrySameStage
            );
            assert_eq!(
                route_failure(kind, Stage::Ocr, 3, 3, 0),
                FailureAction::Terminal
            );
        }
    }

    #[test]
    fn test_router_recoverable_kinds_roll_back_once() {
        for kind in [ErrorKind::InvalidInput, ErrorKind::SchemaMismatch] {
            assert_eq!(
                route_failure(kind, Stage::Cluster, 1, 3, 0),
                FailureAction::RollbackToPrevious
            );
            // A second occurrence in the same workflow escalates
            assert_eq!(
                route_failure(kind, Stage::Cluster, 1, 3, 1),
                FailureAction::Terminal
            );
            // Nothing precedes upload
            assert_eq!(
                route_failure(kind, Stage::Upload, 1, 3, 0),
                FailureAction::Terminal
            );
        }
    }

    #[test]
    fn test_router_terminal_kinds() {
        assert_eq!(
            route_failure(ErrorKind::NoInput, Stage::Upload, 1, 3, 0),
            FailureAction::Terminal
        );
        assert_eq!(
            route_failure(ErrorKind::Internal, Stage::Summary, 1, 3, 0),
            FailureAction::Terminal
        );
    }
}
