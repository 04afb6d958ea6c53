//! Error types for dataset building

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for builder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the raw-data acquisition collaborator. Never retried here.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// Source cannot be reached or does not exist
    #[error("Source unreachable: {url}: {reason}")]
    Unreachable {
        /// Requested location
        url: String,
        /// What went wrong
        reason: String,
    },

    /// Downloaded content differs from the recorded checksum
    #[error("Checksum mismatch for {url}: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// Requested location
        url: String,
        /// Declared checksum
        expected: String,
        /// Checksum of the acquired data
        found: String,
    },

    /// IO error while reading acquired data
    #[error("IO error while acquiring {url}: {source}")]
    Io {
        /// Requested location
        url: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// What happened to the staged output of a failed build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Staged directory and every shard in it were removed
    Removed,

    /// Removal failed; the staged directory may still exist
    Incomplete {
        /// Staged directory
        path: PathBuf,
        /// Removal error
        reason: String,
    },
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupOutcome::Removed => f.write_str("partial output removed"),
            CleanupOutcome::Incomplete { path, reason } => {
                write!(f, "partial output left at {}: {reason}", path.display())
            }
        }
    }
}

/// Error type for builder operations
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the storage layer
    #[error(transparent)]
    Core(#[from] ml_datasets_core::Error),

    /// Error while setting up a generation backend
    #[error(transparent)]
    Backend(#[from] ml_datasets_parallel::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error on dataset metadata
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raw data could not be acquired
    #[error("Acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// A distributed split was requested but no backend is configured
    #[error(
        "Dataset {dataset} generates its splits through a distributed backend, but none is \
         configured; set BuilderOptions::backend or ML_DATASETS_BACKEND"
    )]
    MissingGenerationConfig {
        /// Dataset name
        dataset: String,
    },

    /// Tables were requested before the build reached `Ready`
    #[error("Dataset {dataset} is not prepared; call download_and_prepare first")]
    NotReady {
        /// Dataset name
        dataset: String,
    },

    /// Built splits that the dataset info does not declare
    #[error("Unexpected splits: {0:?}")]
    UnexpectedSplits(Vec<String>),

    /// Declared splits that were not built
    #[error("Expected more splits: {0:?}")]
    ExpectedMoreSplits(Vec<String>),

    /// A built split differs in size from the declared one
    #[error("Split {split} has {found} examples, expected {expected}")]
    NonMatchingSplitSizes {
        /// Split name
        split: String,
        /// Declared example count
        expected: u64,
        /// Built example count
        found: u64,
    },

    /// Split expression cannot be parsed or resolved
    #[error("Invalid split expression {expression:?}: {reason}")]
    SplitExpression {
        /// Offending expression
        expression: String,
        /// What was wrong
        reason: String,
    },

    /// A dataset script callback failed
    #[error("{stage} failed: {source}")]
    Script {
        /// Callback that failed
        stage: &'static str,
        /// Error returned by the script
        #[source]
        source: anyhow::Error,
    },

    /// A concurrent build published a dataset that differs from ours
    #[error("Concurrent build of {path} produced different split sizes")]
    ConflictingBuild {
        /// Published dataset directory
        path: PathBuf,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Aggregate failure of a build after output was staged
    #[error("Build failed (splits {failed_splits:?}; {cleanup}): {source}")]
    Build {
        /// First underlying failure
        #[source]
        source: Box<Error>,
        /// Splits whose generation failed
        failed_splits: Vec<String>,
        /// Outcome of removing the partial output
        cleanup: CleanupOutcome,
    },
}

impl Error {
    /// The underlying failure, looking through [`Error::Build`]
    pub fn root(&self) -> &Error {
        match self {
            Error::Build { source, .. } => source.root(),
            other => other,
        }
    }
}
