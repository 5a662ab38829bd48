//! Error types for the EMX sharding engine.
//!
//! All public APIs return `EmxResult<T>` — no panics in library code.
//! Failures are detected and surfaced at the point of detection; nothing
//! in this crate retries. Retry and recovery policy belongs to the layer
//! driving the forward pass.

use thiserror::Error;

/// Unified error type for all EMX operations.
#[derive(Debug, Error)]
pub enum EmxError {
    /// Module construction rejected the configuration (unsupported
    /// sharding type, incompatible fused parameters, mixed dims, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// A structural invariant of a jagged batch or of the pipeline was
    /// broken (length/value mismatch, cardinality mismatch, ...)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An expected piece of routing metadata was absent. Absence means a
    /// routing/config mismatch upstream, never a recoverable condition.
    #[error("missing routing context: {0}")]
    MissingContext(String),

    /// Destination stream or channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Device-local lookup failure
    #[error("lookup error on table '{table}': {message}")]
    Lookup { table: String, message: String },

    /// Fatal bounds check: a row id fell outside the table
    #[error("row id {index} out of bounds for table '{table}' with {rows} rows")]
    IndexOutOfBounds {
        table: String,
        index: i64,
        rows: usize,
    },

    /// Requested table does not exist
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// Checkpoint save/restore failed
    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),

    /// Standard I/O error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Duplicate lookup registration
    #[error("lookup '{0}' already registered")]
    DuplicateLookup(String),

    /// Lookup handle not found in the registry
    #[error("lookup '{0}' not found")]
    LookupNotFound(String),
}

/// Result type alias for all EMX operations.
pub type EmxResult<T> = Result<T, EmxError>;

impl From<serde_json::Error> for EmxError {
    fn from(err: serde_json::Error) -> Self {
        EmxError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EmxError {
    fn from(err: bincode::Error) -> Self {
        EmxError::Serialization(err.to_string())
    }
}
