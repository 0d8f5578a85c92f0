//! Export renderer contract and a text-format renderer

use crate::blob::BlobStore;
use crate::entities::{
    ArtifactId, ExportArtifact, ExportFormat, NoteImage, Project, ProjectSummary,
};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Renders a project summary into an export artifact
#[async_trait]
pub trait ExportRenderer: Send + Sync {
    /// Render one format; the artifact blob key must be stable per
    /// `(project, format)` so re-runs overwrite
    async fn render(
        &self,
        project: &Project,
        summary: &ProjectSummary,
        images: &[NoteImage],
        format: ExportFormat,
    ) -> ConnectorResult<ExportArtifact>;
}

/// Renderer producing csv/json/markdown into a blob store
///
/// PDF rendering is delegated to a vendor in production; here it renders
/// the markdown body under the pdf key so the pipeline surface is complete.
pub struct TextExportRenderer {
    blobs: Arc<dyn BlobStore>,
}

impl TextExportRenderer {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn render_csv(summary: &ProjectSummary) -> String {
        let mut out = String::from("theme,percentage,note_count\n");
        for theme in &summary.top_themes {
            out.push_str(&format!(
                "{},{:.1},{}\n",
                theme.label.replace(',', ";"),
                theme.percentage,
                theme.note_count
            ));
        }
        out
    }

    fn render_markdown(project: &Project, summary: &ProjectSummary, images: &[NoteImage]) -> String {
        let mut out = format!(
            "# {}\n\n{} images, {} themes\n\n## Themes\n\n",
            project.name,
            images.len(),
            summary.top_themes.len()
        );
        for theme in &summary.top_themes {
            out.push_str(&format!(
                "- **{}** — {} notes ({:.0}%)\n",
                theme.label, theme.note_count, theme.percentage
            ));
        }
        if !summary.representative_quotes.is_empty() {
            out.push_str("\n## Quotes\n\n");
            for quote in &summary.representative_quotes {
                out.push_str(&format!("> {} ({})\n", quote.text, quote.theme));
            }
        }
        if !summary.insights.is_empty() {
            out.push_str("\n## Insights\n\n");
            for insight in &summary.insights {
                out.push_str(&format!("- {insight}\n"));
            }
        }
        out
    }
}

#[async_trait]
impl ExportRenderer for TextExportRenderer {
    async fn render(
        &self,
        project: &Project,
        summary: &ProjectSummary,
        images: &[NoteImage],
        format: ExportFormat,
    ) -> ConnectorResult<ExportArtifact> {
        let body = match format {
            ExportFormat::Csv => Self::render_csv(summary),
            ExportFormat::Json => serde_json::to_string_pretty(summary)
                .map_err(|e| ConnectorError::Internal(format!("serialize summary: {e}")))?,
            ExportFormat::Markdown | ExportFormat::Pdf => {
                Self::render_markdown(project, summary, images)
            }
        };

        let blob_key = format!("exports/{}/summary.{}", project.id, format.extension());
        let bytes = body.into_bytes();
        let size_bytes = bytes.len() as u64;
        self.blobs.put(&blob_key, bytes).await?;
        debug!(project_id = %project.id, format = %format, size_bytes, "export artifact rendered");

        Ok(ExportArtifact {
            id: ArtifactId::new(),
            project_id: project.id.clone(),
            format,
            blob_key,
            size_bytes,
            created_at: Utc::now(),
        })
    }
}
