//! Export stage

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Renders export artifacts, one per requested format
pub struct ExportExecutor;

#[async_trait]
impl StageExecutor for ExportExecutor {
    fn job_type(&self) -> JobType {
        JobType::Export
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Export {
            project_id,
            formats,
        } = payload
        else {
            return Err(payload_mismatch(JobType::Export, payload));
        };
        if formats.is_empty() {
            return Err(PipelineError::Validation(
                "export requires at least one format".to_string(),
            ));
        }

        let project = ctx.connectors.store.project(project_id).await?;
        let summary = ctx
            .connectors
            .store
            .summary(project_id)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidInput(format!("project {project_id} has no summary"))
            })?;
        let images = ctx.connectors.store.images(project_id).await?;

        let total = formats.len();
        let mut artifact_ids = Vec::with_capacity(total);
        for (index, format) in formats.iter().enumerate() {
            ctx.check_cancelled()?;
            let artifact = ctx
                .connectors
                .exporter
                .render(&project, &summary, &images, *format)
                .await?;
            artifact_ids.push(artifact.id.to_string());
            ctx.connectors.store.put_artifact(artifact).await?;
            ctx.report_progress(((index + 1) * 100 / total) as u8);
        }

        debug!(project_id = %project_id, artifacts = artifact_ids.len(), "export stage done");
        Ok(json!({ "artifactIds": artifact_ids }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrawl_connectors::ProjectStore;
    use crate::stages::StageConnectors;
    use crate::workflow::WorkflowId;
    use chrono::Utc;
    use scrawl_connectors::{
        ExportFormat, Project, ProjectId, ProjectSummary, Theme, UserId,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_export_renders_each_format_keyed() {
        let (connectors, store, _blobs) = StageConnectors::in_memory();
        store
            .insert_project(Project::new(ProjectId::new("p1"), UserId::new("u1"), "retro"))
            .await;
        store
            .put_summary(ProjectSummary {
                project_id: ProjectId::new("p1"),
                top_themes: vec![Theme {
                    label: "onboarding".to_string(),
                    percentage: 100.0,
                    note_count: 3,
                }],
                distribution: BTreeMap::new(),
                representative_quotes: vec![],
                insights: vec![],
                generated_at: Utc::now(),
            })
            .await
            .expect("seed summary");
        let (ctx, _progress, _cancel) = StageContext::new(WorkflowId::new(), Arc::new(connectors));

        let payload = JobPayload::Export {
            project_id: ProjectId::new("p1"),
            formats: vec![ExportFormat::Json, ExportFormat::Csv],
        };
        let result = ExportExecutor.execute(&ctx, &payload).await.expect("export");
        assert_eq!(
            result["artifactIds"].as_array().expect("ids").len(),
            2
        );

        // Re-run overwrites the per-format slots instead of appending
        ExportExecutor.execute(&ctx, &payload).await.expect("rerun");
        let artifacts = store.artifacts(&ProjectId::new("p1")).await.expect("load");
        assert_eq!(artifacts.len(), 2);
    }
}
