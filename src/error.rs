use thiserror::Error;

/// Errors raised by the recommendation engine.
///
/// The engine never emits partial results: any of these aborts the current
/// snapshot, and the surrounding loop retries after a backoff.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The snapshot contradicts itself (unordered history, balance out of
    /// range, a referenced channel missing). Guessing here would produce
    /// nonsense recommendations, so we refuse.
    #[error("snapshot invariant violated: {0}")]
    SnapshotInvariant(String),

    /// An impossible state was reached in the decision tree. Indicates a
    /// logic error upstream, not bad node data.
    #[error("computation error: {0}")]
    Computation(String),
}
