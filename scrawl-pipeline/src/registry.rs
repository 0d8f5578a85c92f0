//! Workflow registry
//!
//! Owns every workflow state transition. The orchestrator is the only
//! writer; everything else reads. Each accepted transition is persisted via
//! compare-and-swap and published on the progress bus. Terminal records are
//! retained for a TTL so clients can still fetch results, then purged.

use crate::bus::{Event, EventType, ProgressBus, Topic};
use crate::error::{ErrorInfo, PipelineError, PipelineResult};
use crate::state::StateStore;
use crate::workflow::{rollup_progress, Stage, Workflow, WorkflowId, WorkflowStatus};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use metrics::gauge;
use scrawl_connectors::{ProjectId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// In-memory + persisted workflow map with indexed views
pub struct WorkflowRegistry {
    store: Arc<StateStore>,
    bus: Arc<ProgressBus>,
    workflows: DashMap<WorkflowId, Workflow>,
    by_user: DashMap<UserId, HashSet<WorkflowId>>,
    by_project: DashMap<ProjectId, HashSet<WorkflowId>>,
    retention: Duration,
}

impl WorkflowRegistry {
    /// Build the registry, reloading persisted workflows
    pub fn new(
        store: Arc<StateStore>,
        bus: Arc<ProgressBus>,
        retention: Duration,
    ) -> PipelineResult<Self> {
        let registry = Self {
            store,
            bus,
            workflows: DashMap::new(),
            by_user: DashMap::new(),
            by_project: DashMap::new(),
            retention,
        };
        for workflow in registry.store.workflows()? {
            registry.index(&workflow);
            registry.workflows.insert(workflow.id, workflow);
        }
        Ok(registry)
    }

    fn index(&self, workflow: &Workflow) {
        self.by_user
            .entry(workflow.user_id.clone())
            .or_default()
            .insert(workflow.id);
        self.by_project
            .entry(workflow.project_id.clone())
            .or_default()
            .insert(workflow.id);
    }

    fn publish(&self, workflow: &Workflow, event: EventType, message: Option<String>) {
        self.bus.publish(Event {
            workflow_id: workflow.id,
            project_id: workflow.project_id.clone(),
            user_id: workflow.user_id.clone(),
            event,
            stage: workflow.current_stage,
            progress: workflow.progress,
            status: workflow.status,
            timestamp: Utc::now(),
            message,
            error: workflow.error.clone(),
        });
    }

    /// Apply a guarded mutation, persist it, and publish the event
    fn mutate<F>(
        &self,
        id: WorkflowId,
        event: Option<(EventType, Option<String>)>,
        f: F,
    ) -> PipelineResult<Workflow>
    where
        F: FnOnce(&mut Workflow) -> PipelineResult<()>,
    {
        let mut entry = self
            .workflows
            .get_mut(&id)
            .ok_or_else(|| PipelineError::NotFound(format!("workflow {id}")))?;
        let before = entry.clone();
        f(&mut entry)?;
        entry.last_event_at = Utc::now();
        if !self
            .store
            .compare_and_swap_workflow(id, Some(&before), Some(&entry))?
        {
            // All writers go through this entry lock; a mismatch means the
            // store was touched behind our back
            *entry = before;
            return Err(PipelineError::Conflict(format!(
                "workflow {id} changed concurrently"
            )));
        }
        let after = entry.clone();
        drop(entry);
        if let Some((event_type, message)) = event {
            self.publish(&after, event_type, message);
        }
        Ok(after)
    }

    fn guard_not_terminal(workflow: &Workflow) -> PipelineResult<()> {
        if workflow.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "workflow {} already {}",
                workflow.id, workflow.status
            )));
        }
        Ok(())
    }

    /// Register a freshly created workflow
    pub fn insert(&self, workflow: Workflow) -> PipelineResult<()> {
        if !self
            .store
            .compare_and_swap_workflow(workflow.id, None, Some(&workflow))?
        {
            return Err(PipelineError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        self.index(&workflow);
        self.publish(&workflow, EventType::StatusChanged, None);
        info!(workflow_id = %workflow.id, project_id = %workflow.project_id, "workflow registered");
        self.workflows.insert(workflow.id, workflow);
        gauge!("scrawl_workflows_tracked").set(self.workflows.len() as f64);
        Ok(())
    }

    /// Fetch a workflow
    pub fn get(&self, id: WorkflowId) -> PipelineResult<Workflow> {
        self.workflows
            .get(&id)
            .map(|w| w.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("workflow {id}")))
    }

    /// All tracked workflows
    pub fn all(&self) -> Vec<Workflow> {
        self.workflows.iter().map(|e| e.value().clone()).collect()
    }

    /// Workflows owned by a user, newest first
    pub fn list_user(&self, user_id: &UserId) -> Vec<Workflow> {
        let mut out: Vec<Workflow> = self
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.workflows.get(id).map(|w| w.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    /// Workflows over a project, newest first
    pub fn list_project(&self, project_id: &ProjectId) -> Vec<Workflow> {
        let mut out: Vec<Workflow> = self
            .by_project
            .get(project_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.workflows.get(id).map(|w| w.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    /// The non-terminal workflow for a project, if one exists
    pub fn active_for_project(&self, project_id: &ProjectId) -> Option<WorkflowId> {
        self.by_project.get(project_id).and_then(|ids| {
            ids.iter()
                .find(|id| {
                    self.workflows
                        .get(id)
                        .is_some_and(|w| !w.status.is_terminal())
                })
                .copied()
        })
    }

    /// Enter a stage: pending goes running, running advances
    pub fn mark_stage_started(&self, id: WorkflowId, stage: Stage) -> PipelineResult<Workflow> {
        self.mutate(id, Some((EventType::StageStarted, None)), |w| {
            Self::guard_not_terminal(w)?;
            w.status = WorkflowStatus::Running;
            w.current_stage = stage;
            Ok(())
        })
    }

    /// Fold stage-local job progress into workflow progress
    ///
    /// Decreases are ignored: progress is monotone while running.
    pub fn record_job_progress(
        &self,
        id: WorkflowId,
        stage: Stage,
        job_progress: u8,
    ) -> PipelineResult<Option<Workflow>> {
        let rolled = rollup_progress(stage, job_progress);
        let current = self.get(id)?;
        if current.status != WorkflowStatus::Running || rolled <= current.progress {
            return Ok(None);
        }
        self.mutate(id, Some((EventType::Progress, None)), |w| {
            Self::guard_not_terminal(w)?;
            if rolled > w.progress {
                w.progress = rolled;
            }
            Ok(())
        })
        .map(Some)
    }

    /// Record a stage result and move progress to the stage ceiling
    pub fn record_stage_completed(
        &self,
        id: WorkflowId,
        stage: Stage,
        result: serde_json::Value,
    ) -> PipelineResult<Workflow> {
        self.mutate(id, Some((EventType::StageCompleted, None)), |w| {
            Self::guard_not_terminal(w)?;
            w.stage_results.insert(stage, result);
            w.progress = w.progress.max(stage.cumulative_weight());
            Ok(())
        })
    }

    /// Rewind to an earlier stage after a recoverable failure
    pub fn record_rollback(
        &self,
        id: WorkflowId,
        target: Stage,
        message: String,
    ) -> PipelineResult<Workflow> {
        self.mutate(id, Some((EventType::Rollback, Some(message))), |w| {
            Self::guard_not_terminal(w)?;
            w.rollback_count += 1;
            w.current_stage = target;
            w.progress = target.baseline();
            // Results of the undone stages no longer describe stored state
            w.stage_results.retain(|s, _| *s < target);
            Ok(())
        })
    }

    /// Flip cancellation intent; the driver refuses to advance afterwards
    pub fn request_cancel(&self, id: WorkflowId) -> PipelineResult<bool> {
        let workflow = self.get(id)?;
        if workflow.status.is_terminal() {
            return Ok(false);
        }
        self.mutate(id, None, |w| {
            Self::guard_not_terminal(w)?;
            w.cancel_requested = true;
            Ok(())
        })?;
        Ok(true)
    }

    /// Move a workflow into a terminal state
    ///
    /// Terminal states are absorbing: a second finalize is rejected.
    pub fn finalize(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        error: Option<ErrorInfo>,
    ) -> PipelineResult<Workflow> {
        debug_assert!(status.is_terminal());
        let had_error = error.is_some();
        let finalized = self.mutate(id, Some((EventType::StatusChanged, None)), |w| {
            Self::guard_not_terminal(w)?;
            w.status = status;
            w.completed_at = Some(Utc::now());
            w.error = error;
            if status == WorkflowStatus::Completed {
                w.current_stage = Stage::Completed;
                w.progress = 100;
            }
            Ok(())
        })?;
        if had_error {
            self.publish(&finalized, EventType::Error, None);
        }
        info!(workflow_id = %id, status = %status, "workflow finalized");
        Ok(finalized)
    }

    /// Drop terminal workflows older than the retention window
    ///
    /// Checkpoints and retained bus snapshots go with them. Returns how
    /// many were purged.
    pub fn purge_expired(&self) -> PipelineResult<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.retention).unwrap_or_else(|_| ChronoDuration::hours(24));
        let expired: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|e| {
                let w = e.value();
                w.status.is_terminal() && w.completed_at.is_some_and(|at| at < cutoff)
            })
            .map(|e| e.value().clone())
            .collect();

        for workflow in &expired {
            self.workflows.remove(&workflow.id);
            if let Some(mut ids) = self.by_user.get_mut(&workflow.user_id) {
                ids.remove(&workflow.id);
            }
            if let Some(mut ids) = self.by_project.get_mut(&workflow.project_id) {
                ids.remove(&workflow.id);
            }
            self.store.delete_workflow(workflow.id)?;
            self.store.delete_checkpoints(workflow.id)?;
            self.bus.forget_workflow(workflow.id);
            debug!(workflow_id = %workflow.id, "expired workflow purged");
        }
        gauge!("scrawl_workflows_tracked").set(self.workflows.len() as f64);
        Ok(expired.len())
    }
}
