//! External collaborator contracts for the Scrawl pipeline
//!
//! This crate provides:
//! - Domain entities (projects, images, notes, clusters, summaries, artifacts)
//! - Contracts consumed by the stage executors (store, OCR, cleaner,
//!   clustering, summarizer, export renderer, blob store, cache)
//! - Deterministic in-memory implementations for tests and local runs

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod blob;
pub mod cleaner;
pub mod clustering;
pub mod entities;
pub mod error;
pub mod export;
pub mod memory;
pub mod ocr;
pub mod store;
pub mod summarize;

pub use blob::{BlobStore, Cache, MemoryBlobStore};
pub use cleaner::{CleanOutcome, Cleaner, CorrectionKind, RuleCleaner};
pub use clustering::{ClusterCandidate, ClusteringProvider, LexicalClusterer};
pub use entities::{
    ArtifactId, BlockKind, BoundingBox, CleaningOptions, Cluster, ClusterId, ClusteringMethod,
    ExportArtifact, ExportFormat, ImageId, Note, NoteId, NoteImage, OcrBlock, OcrResult, Project,
    ProjectId, ProjectStatus, ProjectSummary, Quote, SummaryOptions, Theme, UserId,
};
pub use error::{ConnectorError, ConnectorResult};
pub use export::{ExportRenderer, TextExportRenderer};
pub use memory::{FixtureOcr, MemoryProjectStore};
pub use ocr::{OcrOptions, OcrProvider};
pub use store::{EntityKind, ProjectCapture, ProjectStore};
pub use summarize::{Summarizer, ThemeSummarizer};
