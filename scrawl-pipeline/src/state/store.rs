//! Sled-backed state store
//!
//! Layout: one tree per record family. `workflows/{id}` holds the workflow
//! snapshot, `checkpoints/{workflowId}:{seq}` the ordered checkpoints,
//! `jobs/{id}` the queue's job rows. Values are serde_json. Workflow status
//! transitions go through compare-and-swap so a restart never resurrects a
//! terminal workflow.

use crate::checkpoint::Checkpoint;
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{Job, JobId};
use crate::workflow::{Workflow, WorkflowId};
use sled::{Db, Tree};
use std::path::Path;

/// Durable store for engine state
pub struct StateStore {
    db: Db,
    workflows: Tree,
    checkpoints: Tree,
    jobs: Tree,
}

impl StateStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open an ephemeral store; used by tests and the demo
    pub fn temporary() -> PipelineResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> PipelineResult<Self> {
        let workflows = db.open_tree("workflows")?;
        let checkpoints = db.open_tree("checkpoints")?;
        let jobs = db.open_tree("jobs")?;
        Ok(Self {
            db,
            workflows,
            checkpoints,
            jobs,
        })
    }

    fn checkpoint_key(workflow_id: WorkflowId, seq: u32) -> String {
        format!("{workflow_id}:{seq:08}")
    }

    /// Persist a workflow snapshot
    pub fn save_workflow(&self, workflow: &Workflow) -> PipelineResult<()> {
        let value = serde_json::to_vec(workflow)?;
        self.workflows
            .insert(workflow.id.to_string().as_bytes(), value)?;
        Ok(())
    }

    /// Load a workflow snapshot
    pub fn load_workflow(&self, id: WorkflowId) -> PipelineResult<Option<Workflow>> {
        match self.workflows.get(id.to_string().as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Remove a workflow snapshot
    pub fn delete_workflow(&self, id: WorkflowId) -> PipelineResult<()> {
        self.workflows.remove(id.to_string().as_bytes())?;
        Ok(())
    }

    /// All persisted workflows
    pub fn workflows(&self) -> PipelineResult<Vec<Workflow>> {
        let mut out = Vec::new();
        for entry in self.workflows.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Atomically replace a workflow snapshot
    ///
    /// `expected` is the snapshot the caller read; a `None` expectation
    /// asserts the record does not exist yet. Returns false when the stored
    /// bytes no longer match.
    pub fn compare_and_swap_workflow(
        &self,
        id: WorkflowId,
        expected: Option<&Workflow>,
        next: Option<&Workflow>,
    ) -> PipelineResult<bool> {
        let old = expected.map(serde_json::to_vec).transpose()?;
        let new = next.map(serde_json::to_vec).transpose()?;
        let swapped = self
            .workflows
            .compare_and_swap(id.to_string().as_bytes(), old, new)?
            .is_ok();
        Ok(swapped)
    }

    /// Persist a checkpoint
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> PipelineResult<()> {
        let key = Self::checkpoint_key(checkpoint.workflow_id, checkpoint.seq);
        let value = serde_json::to_vec(checkpoint)?;
        self.checkpoints.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Checkpoints for a workflow, ordered by sequence
    pub fn checkpoints(&self, workflow_id: WorkflowId) -> PipelineResult<Vec<Checkpoint>> {
        let prefix = format!("{workflow_id}:");
        let mut out = Vec::new();
        for entry in self.checkpoints.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        // Keys sort by zero-padded seq, but don't rely on it
        out.sort_by_key(|c: &Checkpoint| c.seq);
        Ok(out)
    }

    /// Drop checkpoints newer than `seq`; used after a rollback, when the
    /// undone stages' checkpoints no longer describe stored state
    pub fn delete_checkpoints_after(&self, workflow_id: WorkflowId, seq: u32) -> PipelineResult<()> {
        for checkpoint in self.checkpoints(workflow_id)? {
            if checkpoint.seq > seq {
                let key = Self::checkpoint_key(workflow_id, checkpoint.seq);
                self.checkpoints.remove(key.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Drop all checkpoints for a workflow
    pub fn delete_checkpoints(&self, workflow_id: WorkflowId) -> PipelineResult<()> {
        let prefix = format!("{workflow_id}:");
        let keys: Vec<_> = self
            .checkpoints
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.checkpoints.remove(key)?;
        }
        Ok(())
    }

    /// Persist a job row
    pub fn save_job(&self, job: &Job) -> PipelineResult<()> {
        let value = serde_json::to_vec(job)?;
        self.jobs.insert(job.id.to_string().as_bytes(), value)?;
        Ok(())
    }

    /// Load a job row
    pub fn load_job(&self, id: JobId) -> PipelineResult<Option<Job>> {
        match self.jobs.get(id.to_string().as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Remove a job row
    pub fn delete_job(&self, id: JobId) -> PipelineResult<()> {
        self.jobs.remove(id.to_string().as_bytes())?;
        Ok(())
    }

    /// All persisted jobs
    pub fn jobs(&self) -> PipelineResult<Vec<Job>> {
        let mut out = Vec::new();
        for entry in self.jobs.iter() {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Force everything to disk; doubles as a liveness probe
    pub fn ping(&self) -> PipelineResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("workflows", &self.workflows.len())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowConfig, WorkflowStatus};
    use scrawl_connectors::{ProjectId, UserId};

    fn workflow() -> Workflow {
        Workflow::new(
            ProjectId::new("p1"),
            UserId::new("u1"),
            WorkflowConfig::default(),
        )
    }

    #[test]
    fn test_workflow_round_trip() {
        let store = StateStore::temporary().expect("open");
        let wf = workflow();
        store.save_workflow(&wf).expect("save");
        let loaded = store.load_workflow(wf.id).expect("load").expect("present");
        assert_eq!(loaded, wf);

        store.delete_workflow(wf.id).expect("delete");
        assert!(store.load_workflow(wf.id).expect("load").is_none());
    }

    #[test]
    fn test_compare_and_swap_rejects_stale_writer() {
        let store = StateStore::temporary().expect("open");
        let wf = workflow();
        store.save_workflow(&wf).expect("save");

        let mut fresh = wf.clone();
        fresh.status = WorkflowStatus::Running;
        assert!(store
            .compare_and_swap_workflow(wf.id, Some(&wf), Some(&fresh))
            .expect("cas"));

        // A writer holding the original snapshot loses
        let mut stale = wf.clone();
        stale.status = WorkflowStatus::Cancelled;
        assert!(!store
            .compare_and_swap_workflow(wf.id, Some(&wf), Some(&stale))
            .expect("cas"));
        let stored = store.load_workflow(wf.id).expect("load").expect("present");
        assert_eq!(stored.status, WorkflowStatus::Running);
    }

    #[test]
    fn test_checkpoints_ordered_by_seq() {
        let store = StateStore::temporary().expect("open");
        let wf = workflow();

        // Insert out of order
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let project = scrawl_connectors::MemoryProjectStore::new();
        rt.block_on(project.insert_project(scrawl_connectors::Project::new(
            ProjectId::new("p1"),
            UserId::new("u1"),
            "retro",
        )));
        for seq in [3u32, 1, 2] {
            let checkpoint = rt
                .block_on(crate::checkpoint::Checkpoint::capture(
                    &project,
                    wf.id,
                    crate::workflow::Stage::Ocr,
                    seq,
                    &ProjectId::new("p1"),
                ))
                .expect("capture");
            store.save_checkpoint(&checkpoint).expect("save");
        }

        let list = store.checkpoints(wf.id).expect("list");
        assert_eq!(list.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        store.delete_checkpoints(wf.id).expect("delete");
        assert!(store.checkpoints(wf.id).expect("list").is_empty());
    }
}
