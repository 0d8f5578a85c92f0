//! Request and response bodies

use crate::error::ErrorKind;
use crate::workflow::{WorkflowConfig, WorkflowId};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/projects/{projectId}/workflow`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartWorkflowRequest {
    #[serde(default)]
    pub config: Option<WorkflowConfig>,
}

/// Reply carrying a workflow id
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowIdResponse {
    pub workflow_id: WorkflowId,
}

/// Reply to a cancellation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Error envelope; `detail` never carries internals
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Kind plus user-safe message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}
