//! Error types for generation backends

use thiserror::Error;

/// Result type for backend setup
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for backend setup
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the storage layer
    #[error(transparent)]
    Core(#[from] ml_datasets_core::Error),

    /// Worker pool could not be started
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Invalid backend configuration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
