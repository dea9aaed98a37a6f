use thiserror::Error;

/// Typed error hierarchy for relaydesk.
///
/// Use at module boundaries (ledger, registry, pipeline calls, sink writes).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum RelaydeskError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable store rejected or could not complete a write/read. The
    /// caller must not assume the message was stored.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The reply pipeline did not answer before its deadline. Recovered
    /// locally with a SYSTEM fallback message, never surfaced to the customer.
    #[error("Reply pipeline timed out after {0}s")]
    PipelineTimeout(u64),

    #[error("Reply pipeline error: {0}")]
    Pipeline(String),

    /// A single sink write failed. Only that sink is dropped, never the session.
    #[error("Transport error for sink {sink_id}: {message}")]
    Transport { sink_id: u64, message: String },

    /// A wire event carried an unknown tag or a malformed payload.
    #[error("Invalid client event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using RelaydeskError.
pub type RelaydeskResult<T> = std::result::Result<T, RelaydeskError>;

impl RelaydeskError {
    /// Whether the caller should retry the operation (transient store or
    /// pipeline trouble, as opposed to a malformed request).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelaydeskError::Persistence(_)
                | RelaydeskError::PipelineTimeout(_)
                | RelaydeskError::Pipeline(_)
        )
    }
}

impl From<rusqlite::Error> for RelaydeskError {
    fn from(e: rusqlite::Error) -> Self {
        RelaydeskError::Persistence(e.to_string())
    }
}
