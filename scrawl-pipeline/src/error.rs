//! Error types for the processing workflow engine
//!
//! The error taxonomy is a closed set of kinds. Executors raise kinded
//! errors; the orchestrator's failure router is the only place that turns a
//! kind into a retry, rollback, or terminal decision.

use scrawl_connectors::ConnectorError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Machine-readable error kind, stable across the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    NotAuthorized,
    Validation,
    Conflict,
    InvalidInput,
    SchemaMismatch,
    Timeout,
    RateLimited,
    QuotaExceeded,
    UpstreamUnavailable,
    Network,
    NoInput,
    Internal,
}

impl ErrorKind {
    /// Whether a retry of the same operation can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::QuotaExceeded
                | ErrorKind::UpstreamUnavailable
                | ErrorKind::Network
        )
    }

    /// Wire spelling of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::NotAuthorized => "not-authorized",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::SchemaMismatch => "schema-mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::UpstreamUnavailable => "upstream-unavailable",
            ErrorKind::Network => "network",
            ErrorKind::NoInput => "no-input",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised inside the pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Workflow, project, or job not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller does not own the target
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Request rejected at the edge
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation conflicts with current state (already processing, terminal)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stage input unusable; recoverable by rolling back one stage
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Stage payload shape unusable; recoverable by rolling back one stage
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Collaborator throttled the call
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Account or API quota exhausted
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Collaborator reachable but failing
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Workflow has nothing to process; terminal
    #[error("no input: {0}")]
    NoInput(String),

    /// A worker heartbeat or settle call lost its lease
    #[error("stale lease for job {0}")]
    StaleLease(String),

    /// Durable store unavailable; callers retry under their own policy
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Cooperative cancellation observed by an executor
    #[error("cancelled")]
    Cancelled,

    /// Anything unclassified; terminal
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// The closed taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Conflict(_) | PipelineError::StaleLease(_) => ErrorKind::Conflict,
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::RateLimited(_) => ErrorKind::RateLimited,
            PipelineError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            PipelineError::UpstreamUnavailable(_) | PipelineError::BackendUnavailable(_) => {
                ErrorKind::UpstreamUnavailable
            }
            PipelineError::Network(_) => ErrorKind::Network,
            PipelineError::NoInput(_) => ErrorKind::NoInput,
            PipelineError::Cancelled | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same operation can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ConnectorError> for PipelineError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::NotFound(s) => PipelineError::NotFound(s),
            ConnectorError::InvalidInput(s) => PipelineError::InvalidInput(s),
            ConnectorError::SchemaMismatch(s) => PipelineError::SchemaMismatch(s),
            ConnectorError::Timeout(s) => PipelineError::Timeout(s),
            ConnectorError::RateLimited(s) => PipelineError::RateLimited(s),
            ConnectorError::QuotaExceeded(s) => PipelineError::QuotaExceeded(s),
            ConnectorError::UpstreamUnavailable(s) => PipelineError::UpstreamUnavailable(s),
            ConnectorError::Network(s) => PipelineError::Network(s),
            ConnectorError::Internal(s) => PipelineError::Internal(s),
        }
    }
}

impl From<sled::Error> for PipelineError {
    fn from(err: sled::Error) -> Self {
        PipelineError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(format!("serialization error: {err}"))
    }
}

/// Serializable error payload carried on jobs, workflows, and bus events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub detail: String,
    pub retryable: bool,
}

impl ErrorInfo {
    /// Build from an error, keeping the human detail separate from the kind
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retryable: kind.is_retryable(),
        }
    }
}

impl From<&PipelineError> for ErrorInfo {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}
