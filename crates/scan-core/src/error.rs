//! The error taxonomy shared by every collaborator in the core (spec.md §7).

use thiserror::Error;

/// Errors surfaced by core operations.
///
/// Variants map 1:1 onto the taxonomy in spec.md §7: `InvalidInput` and
/// `NotFound` are caller errors (never retried), `Timeout` and the
/// `*Unavailable` variants are transient infrastructure failures (retried
/// with backoff by the scheduler), `InvalidOutput` covers unparseable
/// scanner/LLM output, and `LoopDetected`/`WorkerLost`/`Cancelled` are
/// terminal, non-retryable conditions.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("scanner image missing: {0}")]
    ImageMissing(String),

    #[error("invalid scan target: {0}")]
    InvalidTarget(String),

    #[error("container resource limits exhausted: {0}")]
    ResourceExhausted(String),

    #[error("LLM endpoint unavailable: {0}")]
    LlmUnavailable(String),

    #[error("key-value store unavailable: {0}")]
    KvUnavailable(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("loop detected in scan output")]
    LoopDetected,

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("worker lost: job was running on a worker that is no longer alive")]
    WorkerLost,

    #[error("job was cancelled")]
    Cancelled,

    #[error("queue '{0}' is full")]
    QueueFull(String),
}

impl CoreError {
    /// Whether the scheduler should retry a task that failed with this error,
    /// independent of attempt-count budget (spec.md §7).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_)
                | CoreError::RuntimeUnavailable(_)
                | CoreError::LlmUnavailable(_)
                | CoreError::KvUnavailable(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
