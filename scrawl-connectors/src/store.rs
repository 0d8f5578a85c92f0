//! Project store contract
//!
//! The persistent project store is the only mutable resource the stage
//! executors share. Every write is keyed so that a re-run overwrites rather
//! than appends; the capture/restore pair and the per-entity operations are
//! what checkpoint rollback drives.

use crate::entities::{
    Cluster, ExportArtifact, Note, NoteImage, OcrResult, Project, ProjectId, ProjectStatus,
    ProjectSummary,
};
use crate::error::ConnectorResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Entity kinds addressable by rollback operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Image,
    Note,
    Cluster,
}

/// Full copy of a project's mutable state
///
/// Captured before a stage runs and restored on rollback. Images are
/// immutable uploads and never captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCapture {
    pub project: Project,
    pub notes: Vec<Note>,
    pub clusters: Vec<Cluster>,
    pub summary: Option<ProjectSummary>,
}

/// Persistent store for projects and their derived entities
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Fetch a project
    async fn project(&self, id: &ProjectId) -> ConnectorResult<Project>;

    /// Update the project-level status
    async fn update_project_status(
        &self,
        id: &ProjectId,
        status: ProjectStatus,
    ) -> ConnectorResult<()>;

    /// All uploaded images for a project
    async fn images(&self, id: &ProjectId) -> ConnectorResult<Vec<NoteImage>>;

    /// All notes for a project
    async fn notes(&self, id: &ProjectId) -> ConnectorResult<Vec<Note>>;

    /// All clusters for a project
    async fn clusters(&self, id: &ProjectId) -> ConnectorResult<Vec<Cluster>>;

    /// Project summary, if one has been generated
    async fn summary(&self, id: &ProjectId) -> ConnectorResult<Option<ProjectSummary>>;

    /// Export artifacts for a project
    async fn artifacts(&self, id: &ProjectId) -> ConnectorResult<Vec<ExportArtifact>>;

    /// Store an OCR result, overwriting any prior result for the image
    async fn put_ocr_result(&self, project_id: &ProjectId, result: OcrResult)
        -> ConnectorResult<()>;

    /// All stored OCR results for a project
    async fn ocr_results(&self, id: &ProjectId) -> ConnectorResult<Vec<OcrResult>>;

    /// Insert or overwrite a note, keyed by `original_id`
    async fn upsert_note(&self, note: Note) -> ConnectorResult<()>;

    /// Set the cleaned text of the note keyed by `original_id`
    async fn set_cleaned_text(
        &self,
        project_id: &ProjectId,
        original_id: &str,
        cleaned: String,
    ) -> ConnectorResult<()>;

    /// Replace all clusters for a project and reassign note memberships
    ///
    /// Prior clusters are cleared first, so a re-run converges instead of
    /// accumulating duplicates.
    async fn replace_clusters(
        &self,
        project_id: &ProjectId,
        clusters: Vec<Cluster>,
    ) -> ConnectorResult<()>;

    /// Store the project summary, overwriting any prior one
    async fn put_summary(&self, summary: ProjectSummary) -> ConnectorResult<()>;

    /// Store an export artifact, keyed by `(project_id, format)`
    async fn put_artifact(&self, artifact: ExportArtifact) -> ConnectorResult<()>;

    /// Capture the project's mutable state for a checkpoint
    async fn capture(&self, id: &ProjectId) -> ConnectorResult<ProjectCapture>;

    /// Restore a previously captured state
    async fn restore(&self, capture: ProjectCapture) -> ConnectorResult<()>;

    /// Create an entity from serialized state (rollback inverse op)
    async fn create_entity(
        &self,
        kind: EntityKind,
        state: serde_json::Value,
    ) -> ConnectorResult<()>;

    /// Overwrite an entity with prior serialized state (rollback inverse op)
    async fn update_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
        state: serde_json::Value,
    ) -> ConnectorResult<()>;

    /// Delete an entity by id (rollback inverse op)
    async fn delete_entity(&self, kind: EntityKind, entity_id: &str) -> ConnectorResult<()>;
}
