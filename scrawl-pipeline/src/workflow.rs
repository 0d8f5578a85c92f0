//! Workflow records, stages, and progress rollup

use crate::error::ErrorInfo;
use chrono::{DateTime, Utc};
use scrawl_connectors::{
    CleaningOptions, ClusteringMethod, ExportFormat, ProjectId, SummaryOptions, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Workflow identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create new workflow ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string form
    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage, in canonical order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Ocr,
    Clean,
    Cluster,
    Summary,
    Export,
    Completed,
}

impl Stage {
    /// The six work stages, in execution order
    pub const WORK_ORDER: [Stage; 6] = [
        Stage::Upload,
        Stage::Ocr,
        Stage::Clean,
        Stage::Cluster,
        Stage::Summary,
        Stage::Export,
    ];

    /// Next stage in canonical order
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Upload => Some(Stage::Ocr),
            Stage::Ocr => Some(Stage::Clean),
            Stage::Clean => Some(Stage::Cluster),
            Stage::Cluster => Some(Stage::Summary),
            Stage::Summary => Some(Stage::Export),
            Stage::Export => Some(Stage::Completed),
            Stage::Completed => None,
        }
    }

    /// Previous work stage, if any
    pub fn prev(self) -> Option<Stage> {
        match self {
            Stage::Upload => None,
            Stage::Ocr => Some(Stage::Upload),
            Stage::Clean => Some(Stage::Ocr),
            Stage::Cluster => Some(Stage::Clean),
            Stage::Summary => Some(Stage::Cluster),
            Stage::Export => Some(Stage::Summary),
            Stage::Completed => Some(Stage::Export),
        }
    }

    /// Workflow progress once this stage has fully completed
    pub fn cumulative_weight(self) -> u8 {
        match self {
            Stage::Upload => 20,
            Stage::Ocr => 35,
            Stage::Clean => 55,
            Stage::Cluster => 75,
            Stage::Summary => 90,
            Stage::Export => 98,
            Stage::Completed => 100,
        }
    }

    /// Workflow progress at entry to this stage
    pub fn baseline(self) -> u8 {
        self.prev().map(Stage::cumulative_weight).unwrap_or(0)
    }

    /// Wire spelling of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Ocr => "ocr",
            Stage::Clean => "clean",
            Stage::Cluster => "cluster",
            Stage::Summary => "summary",
            Stage::Export => "export",
            Stage::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fold a stage-local job progress (0..=100) into workflow progress
pub fn rollup_progress(stage: Stage, job_progress: u8) -> u8 {
    let base = stage.baseline() as u32;
    let span = stage.cumulative_weight() as u32 - base;
    let job = job_progress.min(100) as u32;
    (base + span * job / 100) as u8
}

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Wire spelling of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Enumerated workflow configuration
///
/// Unknown keys are rejected at the edge, not inside executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WorkflowConfig {
    /// Advance stages without operator confirmation
    pub auto_processing: bool,
    pub clustering_method: ClusteringMethod,
    /// Desired cluster count; absent lets the cluster stage choose
    pub target_clusters: Option<usize>,
    pub cleaning_options: CleaningOptions,
    pub summary_options: SummaryOptions,
    /// Formats rendered by the export stage
    pub export_formats: Vec<ExportFormat>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            auto_processing: true,
            clustering_method: ClusteringMethod::Embeddings,
            target_clusters: None,
            cleaning_options: CleaningOptions::default(),
            summary_options: SummaryOptions::default(),
            export_formats: vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Markdown],
        }
    }
}

/// One pipeline run over a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub status: WorkflowStatus,
    pub current_stage: Stage,
    /// 0..=100, non-decreasing while running
    pub progress: u8,
    pub config: WorkflowConfig,
    /// Opaque per-stage result blobs (counts, job ids)
    pub stage_results: BTreeMap<Stage, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub error: Option<ErrorInfo>,
    /// Cancellation intent, flipped by the registry
    pub cancel_requested: bool,
    /// Rollbacks performed so far; a second recoverable failure escalates
    pub rollback_count: u32,
}

impl Workflow {
    /// Create a pending workflow
    pub fn new(project_id: ProjectId, user_id: UserId, config: WorkflowConfig) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            project_id,
            user_id,
            status: WorkflowStatus::Pending,
            current_stage: Stage::Upload,
            progress: 0,
            config,
            stage_results: BTreeMap::new(),
            started_at: now,
            completed_at: None,
            last_event_at: now,
            error: None,
            cancel_requested: false,
            rollback_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_canonical() {
        let mut stage = Stage::Upload;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                Stage::Upload,
                Stage::Ocr,
                Stage::Clean,
                Stage::Cluster,
                Stage::Summary,
                Stage::Export,
                Stage::Completed,
            ]
        );
    }

    #[test]
    fn test_cumulative_weights_match_table() {
        let expected = [
            (Stage::Upload, 20),
            (Stage::Ocr, 35),
            (Stage::Clean, 55),
            (Stage::Cluster, 75),
            (Stage::Summary, 90),
            (Stage::Export, 98),
            (Stage::Completed, 100),
        ];
        for (stage, weight) in expected {
            assert_eq!(stage.cumulative_weight(), weight, "{stage}");
        }
    }

    #[test]
    fn test_rollup_progress_interpolates_within_stage() {
        assert_eq!(rollup_progress(Stage::Upload, 0), 0);
        assert_eq!(rollup_progress(Stage::Upload, 100), 20);
        assert_eq!(rollup_progress(Stage::Ocr, 0), 20);
        assert_eq!(rollup_progress(Stage::Ocr, 50), 27);
        assert_eq!(rollup_progress(Stage::Ocr, 100), 35);
        assert_eq!(rollup_progress(Stage::Export, 100), 98);
        // Over-reporting clamps at the stage ceiling
        assert_eq!(rollup_progress(Stage::Clean, 200), 55);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        let err = serde_json::from_str::<WorkflowConfig>(r#"{"autoProcessing":true,"gpu":true}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: WorkflowConfig = serde_json::from_str("{}").expect("defaults apply");
        assert!(config.auto_processing);
        assert_eq!(config.clustering_method, ClusteringMethod::Embeddings);
        assert_eq!(config.target_clusters, None);
        assert_eq!(config.export_formats.len(), 3);
    }
}
