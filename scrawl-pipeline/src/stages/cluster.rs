//! Clustering stage
//!
//! Clears prior clusters for the project first, so a re-run converges to a
//! single fresh assignment.

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use scrawl_connectors::{Cluster, ClusterId};
use serde_json::json;
use tracing::debug;

/// Groups cleaned notes into labelled clusters
pub struct ClusterExecutor;

/// Cluster count used when the config leaves it unset
pub fn default_target_clusters(note_count: usize) -> usize {
    let sqrt = ((note_count as f64) / 2.0).sqrt().ceil() as usize;
    sqrt.clamp(2, 10)
}

#[async_trait]
impl StageExecutor for ClusterExecutor {
    fn job_type(&self) -> JobType {
        JobType::Cluster
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Cluster {
            project_id,
            method,
            target_clusters,
        } = payload
        else {
            return Err(payload_mismatch(JobType::Cluster, payload));
        };

        let notes = ctx.connectors.store.notes(project_id).await?;
        if notes.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "project {project_id} has no notes to cluster"
            )));
        }
        ctx.check_cancelled()?;

        let target = target_clusters.unwrap_or_else(|| default_target_clusters(notes.len()));
        ctx.report_progress(10);
        let candidates = ctx
            .connectors
            .clustering
            .cluster(&notes, *method, target)
            .await?;
        if candidates.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "clustering produced no groups for project {project_id}"
            )));
        }
        ctx.check_cancelled()?;
        ctx.report_progress(70);

        let clusters: Vec<Cluster> = candidates
            .into_iter()
            .map(|c| Cluster {
                id: ClusterId::new(),
                project_id: project_id.clone(),
                label: c.label,
                member_ids: c.member_ids,
                confidence: c.confidence,
                centroid: c.centroid,
            })
            .collect();
        let cluster_count = clusters.len();
        let mean_confidence =
            clusters.iter().map(|c| c.confidence).sum::<f32>() / cluster_count as f32;

        ctx.connectors
            .store
            .replace_clusters(project_id, clusters)
            .await?;
        ctx.report_progress(100);

        debug!(project_id = %project_id, cluster_count, mean_confidence, "cluster stage done");
        Ok(json!({ "clusterCount": cluster_count, "meanConfidence": mean_confidence }))
    }
}
