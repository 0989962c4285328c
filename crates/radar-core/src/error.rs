//! Error taxonomy
//!
//! Each variant carries its retry discipline: malformed events dead-letter
//! immediately, persistence failures are retried with bounded backoff,
//! correlation conflicts are resolved by the merge tie-break and logged,
//! delivery failures stay scoped to their provider.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RadarError {
    /// Unrecoverable for that message. Dead-letter, do not retry.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Transient storage failure. Retry with backoff, then dead-letter.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Two campaigns claimed conflicting anchors. Resolved by merging into
    /// the earlier-created campaign; never fatal.
    #[error("correlation inconsistency: {0}")]
    CorrelationInconsistency(String),

    /// Per-provider dispatch failure, reported in the outcome set.
    #[error("orchestration delivery failed for {provider}: {reason}")]
    OrchestrationDelivery { provider: String, reason: String },
}

impl RadarError {
    /// Whether the ingestion pipeline may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
