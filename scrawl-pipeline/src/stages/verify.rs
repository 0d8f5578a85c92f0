//! Upload verification stage

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Confirms the project has images to process
pub struct VerifyExecutor;

#[async_trait]
impl StageExecutor for VerifyExecutor {
    fn job_type(&self) -> JobType {
        JobType::Verify
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Verify { project_id } = payload else {
            return Err(payload_mismatch(JobType::Verify, payload));
        };

        let images = ctx.connectors.store.images(project_id).await?;
        if images.is_empty() {
            return Err(PipelineError::NoInput(format!(
                "project {project_id} has no images"
            )));
        }
        debug!(project_id = %project_id, image_count = images.len(), "uploads verified");
        ctx.report_progress(100);
        Ok(json!({ "imageCount": images.len(), "ok": true }))
    }
}
