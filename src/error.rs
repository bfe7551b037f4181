//! Crate-wide error taxonomy.
//!
//! Persistence errors are fatal for the operation that triggered them;
//! analyzer/index/embedder errors are caught by callers in `search` and
//! demoted into a `degraded` flag on the response rather than propagated.

/// The crate-wide result alias. Every public operation returns this.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine's public operations.
///
/// Variant names carry the semantic of the error taxonomy; match on them,
/// don't match on the formatted message.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A memory, rule, or code entity id was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad category, empty trigger, unknown relationship, confidence out of
    /// range, self-edge, or similar caller-supplied invalidity.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A uniqueness constraint was violated (duplicate edge, duplicate
    /// file-hash row, etc).
    #[error("conflict: {0}")]
    Conflict(String),

    /// `requires_initialization` rejected the call; `operation` names the
    /// composite operation (`briefing`) the caller must invoke first.
    #[error("initialization required: call {operation} first")]
    InitRequired {
        /// The operation name the caller should invoke to obtain a token.
        operation: &'static str,
    },

    /// `requires_context` rejected the call because no live context token
    /// exists for this project.
    #[error("context check required: call {operation} first")]
    ContextCheckRequired {
        /// The operation name the caller should invoke to obtain a token.
        operation: &'static str,
    },

    /// An embedder or fetch call exceeded its timeout. Non-fatal: the
    /// caller should continue with degraded retrieval.
    #[error("timeout in {0}")]
    Timeout(String),

    /// An embedder, git probe, or doc-fetch collaborator failed.
    /// Non-fatal: the caller should continue with degraded retrieval.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The persistence layer failed. Fatal for the current operation.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A filesystem operation failed (watcher, code indexer, doc ingest).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// (de)serialization of a stored JSON column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any failure not otherwise classified. Implementations log full
    /// context via `tracing::error!` before returning this variant so the
    /// caller only sees a redacted summary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors that a retrieval pipeline should treat as
    /// `DEGRADED` rather than propagate: embedder/backend/timeout failures.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_) | EngineError::BackendError(_)
        )
    }
}
