//! Summary stage

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Summarizes clustered findings into the project summary
pub struct SummaryExecutor;

#[async_trait]
impl StageExecutor for SummaryExecutor {
    fn job_type(&self) -> JobType {
        JobType::Summary
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Summary {
            project_id,
            options,
        } = payload
        else {
            return Err(payload_mismatch(JobType::Summary, payload));
        };

        let project = ctx.connectors.store.project(project_id).await?;
        let clusters = ctx.connectors.store.clusters(project_id).await?;
        if clusters.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "project {project_id} has no clusters to summarize"
            )));
        }
        let notes = ctx.connectors.store.notes(project_id).await?;
        ctx.check_cancelled()?;
        ctx.report_progress(30);

        let summary = ctx
            .connectors
            .summarizer
            .summarize(&project, &clusters, &notes, options)
            .await?;
        let theme_count = summary.top_themes.len();
        ctx.connectors.store.put_summary(summary).await?;
        ctx.report_progress(100);

        debug!(project_id = %project_id, theme_count, "summary stage done");
        Ok(json!({ "themeCount": theme_count }))
    }
}
