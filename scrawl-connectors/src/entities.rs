//! Domain entities shared between the pipeline and its collaborators
//!
//! A project owns uploaded note images; OCR turns images into text blocks,
//! which become notes; clustering groups notes into labelled clusters; the
//! summary and export artifacts hang off the project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Project identifier (opaque, caller-assigned)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier (opaque, caller-assigned)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Note image identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub Uuid);

impl ImageId {
    /// Create new image ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Note identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub Uuid);

impl NoteId {
    /// Create new note ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub Uuid);

impl ClusterId {
    /// Create new cluster ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClusterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Export artifact identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    /// Create new artifact ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project lifecycle status as seen by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Created, images may still be uploading
    Draft,
    /// A workflow is running over the project
    Processing,
    /// Last workflow completed
    Completed,
    /// Last workflow failed
    Failed,
}

/// A project: one batch of handwritten-note images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner: UserId,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new draft project
    pub fn new(id: ProjectId, owner: UserId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            name: name.into(),
            status: ProjectStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An uploaded note image (sticky note or whiteboard photo)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteImage {
    pub id: ImageId,
    pub project_id: ProjectId,
    /// Key into the blob store holding the image bytes
    pub blob_key: String,
    pub content_type: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Kind of text block the OCR engine produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Word,
    Line,
    Paragraph,
}

/// Bounding box in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One recognized text block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrBlock {
    /// Engine-assigned block id, stable per image
    pub id: String,
    pub text: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub kind: BlockKind,
}

/// OCR output for a single image, keyed by image id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub image_id: ImageId,
    pub blocks: Vec<OcrBlock>,
    pub mean_confidence: f32,
}

impl OcrResult {
    /// Build a result, computing the mean confidence from the blocks
    pub fn from_blocks(image_id: ImageId, blocks: Vec<OcrBlock>) -> Self {
        let mean_confidence = if blocks.is_empty() {
            0.0
        } else {
            blocks.iter().map(|b| b.confidence).sum::<f32>() / blocks.len() as f32
        };
        Self {
            image_id,
            blocks,
            mean_confidence,
        }
    }
}

/// One text snippet extracted from an image
///
/// `original_id` is the stable key (`{image_id}:{block_id}`) that keeps
/// cleaning and re-runs idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub project_id: ProjectId,
    pub image_id: ImageId,
    pub original_id: String,
    pub text: String,
    pub cleaned_text: Option<String>,
    pub cluster_id: Option<ClusterId>,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// A group of semantically related notes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub project_id: ProjectId,
    pub label: String,
    pub member_ids: Vec<NoteId>,
    pub confidence: f32,
    pub centroid: Option<Vec<f32>>,
}

/// Theme entry in a project summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub label: String,
    /// Share of notes in this theme, 0.0..=100.0
    pub percentage: f32,
    pub note_count: usize,
}

/// Representative quote attached to a theme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub theme: String,
    pub text: String,
}

/// Project-level summary of clustered findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: ProjectId,
    pub top_themes: Vec<Theme>,
    /// Theme label -> share of notes, 0.0..=100.0
    pub distribution: BTreeMap<String, f32>,
    pub representative_quotes: Vec<Quote>,
    pub insights: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Export output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Pdf,
    Csv,
    Json,
    Markdown,
}

impl ExportFormat {
    /// File extension for the format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Markdown => "md",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Rendered export artifact, keyed by `(project_id, format)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub id: ArtifactId,
    pub project_id: ProjectId,
    pub format: ExportFormat,
    /// Key into the blob store holding the rendered bytes
    pub blob_key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Clustering strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringMethod {
    /// Vector-embedding similarity
    #[default]
    Embeddings,
    /// LLM-driven grouping
    Llm,
    /// Embedding candidates refined by an LLM pass
    Hybrid,
}

/// Text cleaning switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CleaningOptions {
    pub spell_check: bool,
    pub remove_artifacts: bool,
    pub normalize_spacing: bool,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        Self {
            spell_check: true,
            remove_artifacts: true,
            normalize_spacing: true,
        }
    }
}

/// Summary generation switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SummaryOptions {
    pub include_quotes: bool,
    pub include_distribution: bool,
    pub max_themes: usize,
    /// Themes below this share of notes are folded away, 0.0..=100.0
    pub min_theme_percentage: f32,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            include_quotes: true,
            include_distribution: true,
            max_themes: 5,
            min_theme_percentage: 5.0,
        }
    }
}
