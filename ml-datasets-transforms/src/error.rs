//! Error types for cached transformations

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for transformation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for transformation operations
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the storage layer
    #[error(transparent)]
    Core(#[from] ml_datasets_core::Error),

    /// IO error on the cache directory
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Binary serialization error while fingerprinting arguments
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// User-supplied function failed
    #[error("{operation} failed: {source}")]
    Transformation {
        /// Operation that invoked the function
        operation: &'static str,
        /// Error returned by the function
        #[source]
        source: anyhow::Error,
    },

    /// Cache entry exists but cannot be read
    #[error("Invalid cache entry {path}: {reason}")]
    InvalidCacheEntry {
        /// Entry directory
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// An in-process cache lock was poisoned by a panicking computation
    #[error("Cache lock poisoned")]
    LockPoisoned,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn transformation(operation: &'static str, source: anyhow::Error) -> Self {
        Error::Transformation { operation, source }
    }
}
