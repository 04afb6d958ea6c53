//! Error types for dataset encoding, storage and access

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for dataset core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dataset core operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value does not conform to its feature specification
    #[error("Schema mismatch at '{path}': {reason}")]
    SchemaMismatch {
        /// Dotted path of the offending field
        path: String,
        /// What was wrong with the value
        reason: String,
    },

    /// An example could not be encoded, aborting the enclosing write
    #[error("Encoding failed for row {row}: {source}")]
    EncodingFailure {
        /// Index of the offending row within the write
        row: u64,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A shard's embedded schema disagrees with the requested one
    #[error("Schema version mismatch in {path}: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Shard file
        path: PathBuf,
        /// Requested schema
        expected: String,
        /// Schema embedded in the shard
        found: String,
    },

    /// Shard file is truncated or malformed
    #[error("Corrupt shard {path}: {reason}")]
    CorruptShard {
        /// Shard file
        path: PathBuf,
        /// What failed to validate
        reason: String,
    },

    /// Index out of bounds
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: u64,
        /// Number of available items
        len: u64,
    },

    /// Column not present in the schema
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Example generation failed in user code
    #[error("Generation error: {0}")]
    Generation(#[source] anyhow::Error),
}

impl Error {
    /// Build a schema mismatch error for the given field path
    pub fn schema_mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build a corrupt shard error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptShard {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
