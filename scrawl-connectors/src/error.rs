//! Error types for collaborator contracts

use thiserror::Error;

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors raised by external collaborators
///
/// The pipeline maps these onto its own error taxonomy; connectors never
/// decide retry policy themselves.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// Entity not found in the backing store
    #[error("not found: {0}")]
    NotFound(String),

    /// Input rejected by the collaborator
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Payload shape did not match what the collaborator expects
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Collaborator call exceeded its deadline
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

    /// Anything the collaborator could not classify
    #[error("internal connector error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Whether retrying the same call can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Timeout(_)
                | ConnectorError::RateLimited(_)
                | ConnectorError::QuotaExceeded(_)
                | ConnectorError::UpstreamUnavailable(_)
                | ConnectorError::Network(_)
        )
    }
}
