//! Text cleaning stage

use super::{payload_mismatch, StageContext, StageExecutor};
use crate::error::{PipelineError, PipelineResult};
use crate::queue::job::{JobPayload, JobType};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Applies the deterministic cleaner to every note
pub struct CleanExecutor;

#[async_trait]
impl StageExecutor for CleanExecutor {
    fn job_type(&self) -> JobType {
        JobType::Clean
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        payload: &JobPayload,
    ) -> PipelineResult<serde_json::Value> {
        let JobPayload::Clean {
            project_id,
            options,
        } = payload
        else {
            return Err(payload_mismatch(JobType::Clean, payload));
        };

        let notes = ctx.connectors.store.notes(project_id).await?;
        if notes.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "project {project_id} has no notes to clean"
            )));
        }

        let total = notes.len();
        let mut corrections_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for (index, note) in notes.iter().enumerate() {
            ctx.check_cancelled()?;
            let outcome = ctx.connectors.cleaner.clean(&note.text, options);
            for (kind, count) in &outcome.corrections {
                let key = serde_json::to_value(kind)?
                    .as_str()
                    .unwrap_or("other")
                    .to_string();
                *corrections_by_type.entry(key).or_insert(0) += u64::from(*count);
            }
            ctx.connectors
                .store
                .set_cleaned_text(project_id, &note.original_id, outcome.text)
                .await?;
            ctx.report_progress(((index + 1) * 100 / total) as u8);
        }

        debug!(project_id = %project_id, notes = total, "clean stage done");
        Ok(json!({ "correctionsByType": corrections_by_type }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrawl_connectors::ProjectStore;
    use crate::error::ErrorKind;
    use crate::stages::StageConnectors;
    use crate::workflow::WorkflowId;
    use chrono::Utc;
    use scrawl_connectors::{
        CleaningOptions, ImageId, Note, NoteId, Project, ProjectId, UserId,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn test_clean_writes_cleaned_text_and_counts() {
        let (connectors, store, _blobs) = StageConnectors::in_memory();
        store
            .insert_project(Project::new(ProjectId::new("p1"), UserId::new("u1"), "retro"))
            .await;
        store
            .upsert_note(Note {
                id: NoteId::new(),
                project_id: ProjectId::new("p1"),
                image_id: ImageId::new(),
                original_id: "i:b0".to_string(),
                text: "teh   plan ~~".to_string(),
                cleaned_text: None,
                cluster_id: None,
                confidence: 0.9,
                created_at: Utc::now(),
            })
            .await
            .expect("seed note");
        let (ctx, _progress, _cancel) = StageContext::new(WorkflowId::new(), Arc::new(connectors));

        let result = CleanExecutor
            .execute(
                &ctx,
                &JobPayload::Clean {
                    project_id: ProjectId::new("p1"),
                    options: CleaningOptions::default(),
                },
            )
            .await
            .expect("clean succeeds");

        let by_type = result["correctionsByType"]
            .as_object()
            .expect("map result");
        assert!(by_type.contains_key("spelling"));
        assert!(by_type.contains_key("artifact"));

        let notes = store.notes(&ProjectId::new("p1")).await.expect("notes");
        assert_eq!(notes[0].cleaned_text.as_deref(), Some("the plan"));
    }

    #[tokio::test]
    async fn test_clean_without_notes_is_invalid_input() {
        let (connectors, store, _blobs) = StageConnectors::in_memory();
        store
            .insert_project(Project::new(ProjectId::new("p1"), UserId::new("u1"), "retro"))
            .await;
        let (ctx, _progress, _cancel) = StageContext::new(WorkflowId::new(), Arc::new(connectors));

        let err = CleanExecutor
            .execute(
                &ctx,
                &JobPayload::Clean {
                    project_id: ProjectId::new("p1"),
                    options: CleaningOptions::default(),
                },
            )
            .await
            .expect_err("no notes");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
