use thiserror::Error;

/// Convenience type alias for Results with `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy for the extraction core. `IndexDegraded`, `CacheDegraded`
/// and `ValidatorVersionMismatch` are never returned across the
/// `ExtractionPipeline::process` boundary — they are caught inside the
/// engine and folded into certificate/telemetry flags — but are kept as
/// concrete variants so the internal fallback paths have something precise
/// to match on.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("embedding provider unavailable")]
    EmbeddingUnavailable,

    #[error("vector index degraded: {0}")]
    IndexDegraded(String),

    #[error("cache store degraded: {0}")]
    CacheDegraded(String),

    #[error("model tier failure: {message}")]
    ModelFailure { retryable: bool, message: String },

    #[error("budget exhausted")]
    BudgetExhausted,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("overloaded")]
    Overloaded,

    #[error("validator version mismatch: expected {expected}, found {found}")]
    ValidatorVersionMismatch { expected: u32, found: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this error is safe to retry on the same tier.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ModelFailure { retryable: true, .. })
    }
}
