use thiserror::Error;

/// Errors surfaced by the fetch/cache/compute pipeline.
///
/// Per-source failures are isolated: only a `required` source propagates its
/// error out of the orchestrator. Durable cache tier failures never reach
/// callers at all; they degrade to a cache miss at the store boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid source configuration. Fatal only when the source
    /// is marked required.
    #[error("config error: {0}")]
    Config(String),

    /// Network-level fetch failure. Recoverable through the stale-cache
    /// fallback when a prior entry exists. `retryable` marks transient
    /// failures (timeouts, 5xx) worth another attempt.
    #[error("network error for source {source_id}: {message}")]
    Network {
        source_id: String,
        message: String,
        retryable: bool,
    },

    /// The computation unit crashed or reported an internal error. All
    /// pending calls on the session are rejected and the unit is discarded;
    /// the next request starts a fresh one.
    #[error("computation unit error: {0}")]
    ComputationUnit(String),

    /// Caller-initiated cancellation. Not logged as a failure.
    #[error("cancelled")]
    Cancelled,

    /// Malformed or version-mismatched durable entry. Treated as a miss
    /// inside the cache store; carried here only for internal accounting.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),
}

impl PipelineError {
    pub fn network(source_id: &str, message: impl Into<String>) -> Self {
        PipelineError::Network {
            source_id: source_id.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A network failure that another attempt will not fix (e.g. 404).
    pub fn network_fatal(source_id: &str, message: impl Into<String>) -> Self {
        PipelineError::Network {
            source_id: source_id.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Network { retryable: true, .. })
    }

    /// Whether the error is a cancellation rather than a real fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
