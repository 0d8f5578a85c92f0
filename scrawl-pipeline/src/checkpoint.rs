//! Checkpoints and rollback actions
//!
//! A checkpoint is captured before a stage runs: the full project capture
//! plus an ordered inverse list. Inverse actions are applied newest-first,
//! then the target checkpoint's snapshot is restored, so rollback lands on
//! the state the stage saw when it started.

use crate::error::{PipelineError, PipelineResult};
use crate::workflow::{Stage, WorkflowId};
use chrono::{DateTime, Utc};
use scrawl_connectors::{EntityKind, ProjectCapture, ProjectStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Checkpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    /// Create new checkpoint ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

/// Inverse operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackOp {
    /// Remove an entity a later stage created
    Delete,
    /// Overwrite an entity with its prior state
    Update,
    /// Restore an entity from the checkpoint snapshot
    Restore,
}

/// One inverse operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackAction {
    pub stage: Stage,
    pub op: RollbackOp,
    pub entity: EntityKind,
    pub entity_id: String,
    pub prior_state: Option<serde_json::Value>,
}

/// Rollback anchor captured before entering a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub workflow_id: WorkflowId,
    pub stage: Stage,
    /// Total order of checkpoints within a workflow
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub project_snapshot: ProjectCapture,
    /// Ordered inverse list; applied in reverse on rollback
    pub rollback_actions: Vec<RollbackAction>,
}

impl Checkpoint {
    /// Capture the project state ahead of `stage`
    pub async fn capture(
        store: &dyn ProjectStore,
        workflow_id: WorkflowId,
        stage: Stage,
        seq: u32,
        project_id: &scrawl_connectors::ProjectId,
    ) -> PipelineResult<Self> {
        let snapshot = store.capture(project_id).await?;

        let mut rollback_actions = vec![RollbackAction {
            stage,
            op: RollbackOp::Restore,
            entity: EntityKind::Project,
            entity_id: snapshot.project.id.to_string(),
            prior_state: Some(serde_json::to_value(&snapshot.project)?),
        }];
        for note in &snapshot.notes {
            rollback_actions.push(RollbackAction {
                stage,
                op: RollbackOp::Update,
                entity: EntityKind::Note,
                entity_id: note.id.to_string(),
                prior_state: Some(serde_json::to_value(note)?),
            });
        }
        for cluster in &snapshot.clusters {
            rollback_actions.push(RollbackAction {
                stage,
                op: RollbackOp::Update,
                entity: EntityKind::Cluster,
                entity_id: cluster.id.to_string(),
                prior_state: Some(serde_json::to_value(cluster)?),
            });
        }

        Ok(Self {
            id: CheckpointId::new(),
            workflow_id,
            stage,
            seq,
            timestamp: Utc::now(),
            project_snapshot: snapshot,
            rollback_actions,
        })
    }

    /// Append delete actions for entities created since the capture
    ///
    /// Called once the stage settles, so the inverse list covers what the
    /// stage actually wrote.
    pub fn record_created(&mut self, current: &ProjectCapture) {
        let known_notes: BTreeSet<String> = self
            .project_snapshot
            .notes
            .iter()
            .map(|n| n.id.to_string())
            .collect();
        let known_clusters: BTreeSet<String> = self
            .project_snapshot
            .clusters
            .iter()
            .map(|c| c.id.to_string())
            .collect();

        for note in &current.notes {
            let id = note.id.to_string();
            if !known_notes.contains(&id) {
                self.rollback_actions.push(RollbackAction {
                    stage: self.stage,
                    op: RollbackOp::Delete,
                    entity: EntityKind::Note,
                    entity_id: id,
                    prior_state: None,
                });
            }
        }
        for cluster in &current.clusters {
            let id = cluster.id.to_string();
            if !known_clusters.contains(&id) {
                self.rollback_actions.push(RollbackAction {
                    stage: self.stage,
                    op: RollbackOp::Delete,
                    entity: EntityKind::Cluster,
                    entity_id: id,
                    prior_state: None,
                });
            }
        }
    }
}

/// Apply inverse actions, newest-first
///
/// Each action is transactional on its own; the first failure aborts and
/// surfaces so the caller can promote the workflow to failed with a
/// composite error.
pub async fn apply_rollback_actions(
    store: &dyn ProjectStore,
    actions: &[RollbackAction],
) -> PipelineResult<()> {
    for action in actions.iter().rev() {
        match action.op {
            RollbackOp::Delete => {
                store.delete_entity(action.entity, &action.entity_id).await?;
            }
            RollbackOp::Update | RollbackOp::Restore => {
                let prior = action.prior_state.clone().ok_or_else(|| {
                    PipelineError::Internal(format!(
                        "rollback action for {} {} has no prior state",
                        action.entity_id, action.stage
                    ))
                })?;
                store
                    .update_entity(action.entity, &action.entity_id, prior)
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scrawl_connectors::{
        MemoryProjectStore, Note, NoteId, Project, ProjectId, UserId,
    };

    async fn seeded_store() -> (MemoryProjectStore, ProjectId) {
        let store = MemoryProjectStore::new();
        let project_id = ProjectId::new("p1");
        store
            .insert_project(Project::new(project_id.clone(), UserId::new("u1"), "retro"))
            .await;
        (store, project_id)
    }

    fn note(project_id: &ProjectId, original_id: &str, text: &str) -> Note {
        Note {
            id: NoteId::new(),
            project_id: project_id.clone(),
            image_id: scrawl_connectors::ImageId::new(),
            original_id: original_id.to_string(),
            text: text.to_string(),
            cleaned_text: None,
            cluster_id: None,
            confidence: 0.9,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_capture_lists_existing_entities() {
        let (store, project_id) = seeded_store().await;
        store
            .upsert_note(note(&project_id, "a", "hello"))
            .await
            .expect("upsert");

        let checkpoint = Checkpoint::capture(&store, WorkflowId::new(), Stage::Clean, 2, &project_id)
            .await
            .expect("capture");

        assert_eq!(checkpoint.project_snapshot.notes.len(), 1);
        // Project restore action plus one note update action
        assert_eq!(checkpoint.rollback_actions.len(), 2);
        assert!(checkpoint
            .rollback_actions
            .iter()
            .any(|a| a.op == RollbackOp::Restore && a.entity == EntityKind::Project));
    }

    #[tokio::test]
    async fn test_record_created_adds_delete_actions() {
        let (store, project_id) = seeded_store().await;
        let mut checkpoint =
            Checkpoint::capture(&store, WorkflowId::new(), Stage::Ocr, 1, &project_id)
                .await
                .expect("capture");

        // Stage writes a note after the capture
        store
            .upsert_note(note(&project_id, "a", "created later"))
            .await
            .expect("upsert");
        let current = store.capture(&project_id).await.expect("capture");
        checkpoint.record_created(&current);

        let deletes: Vec<_> = checkpoint
            .rollback_actions
            .iter()
            .filter(|a| a.op == RollbackOp::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].entity, EntityKind::Note);
    }

    #[tokio::test]
    async fn test_apply_rollback_restores_prior_state() {
        let (store, project_id) = seeded_store().await;
        store
            .upsert_note(note(&project_id, "a", "original"))
            .await
            .expect("upsert");
        let mut checkpoint =
            Checkpoint::capture(&store, WorkflowId::new(), Stage::Clean, 2, &project_id)
                .await
                .expect("capture");

        // Stage mutates the note and creates another
        store
            .set_cleaned_text(&project_id, "a", "mutated".to_string())
            .await
            .expect("set cleaned");
        store
            .upsert_note(note(&project_id, "b", "extra"))
            .await
            .expect("upsert");
        let current = store.capture(&project_id).await.expect("capture");
        checkpoint.record_created(&current);

        apply_rollback_actions(&store, &checkpoint.rollback_actions)
            .await
            .expect("rollback applies");
        store
            .restore(checkpoint.project_snapshot.clone())
            .await
            .expect("restore");

        let after = store.capture(&project_id).await.expect("capture");
        assert_eq!(after.notes, checkpoint.project_snapshot.notes);
        assert_eq!(after.clusters, checkpoint.project_snapshot.clusters);
    }
}
