//! OCR stage
//!
//! Runs the OCR provider over every image, stores the per-image result, and
//! materializes one note per recognized block. Notes are keyed by
//! `{image_id}:{block_id}` so re-runs overwrite instead of duplicating.

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::PipelineResult;
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use chrono::Utc;
use scrawl_connectors::{Note, NoteId, OcrOptions};
use serde_json::json;
use tracing::debug;

/// Extracts text blocks from uploaded images
pub struct OcrExecutor;

#[async_trait]
impl StageExecutor for OcrExecutor {
    fn job_type(&self) -> JobType {
        JobType::Ocr
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Ocr { project_id } = payload else {
            return Err(payload_mismatch(JobType::Ocr, payload));
        };

        let images = ctx.connectors.store.images(project_id).await?;
        let options = OcrOptions::default();
        let total = images.len().max(1);
        let mut blocks_total = 0usize;
        let mut confidence_sum = 0.0f32;
        let mut confidence_count = 0usize;

        for (index, image) in images.iter().enumerate() {
            ctx.check_cancelled()?;
            let result = ctx.connectors.ocr.process(image, &options).await?;

            blocks_total += result.blocks.len();
            if !result.blocks.is_empty() {
                confidence_sum += result.mean_confidence;
                confidence_count += 1;
            }

            for block in &result.blocks {
                let note = Note {
                    id: NoteId::new(),
                    project_id: project_id.clone(),
                    image_id: image.id,
                    original_id: format!("{}:{}", image.id, block.id),
                    text: block.text.clone(),
                    cleaned_text: None,
                    cluster_id: None,
                    confidence: block.confidence,
                    created_at: Utc::now(),
                };
                ctx.connectors.store.upsert_note(note).await?;
            }
            ctx.connectors
                .store
                .put_ocr_result(project_id, result)
                .await?;
            ctx.report_progress(((index + 1) * 100 / total) as u8);
        }

        let mean_confidence = if confidence_count == 0 {
            0.0
        } else {
            confidence_sum / confidence_count as f32
        };
        debug!(project_id = %project_id, blocks_total, mean_confidence, "ocr stage done");
        Ok(json!({ "blocksTotal": blocks_total, "meanConfidence": mean_confidence }))
    }
}
