//! Data-parallel example generation backends
//!
//! [`LocalParallelBackend`] implements the core
//! [`GenerationBackend`](ml_datasets_core::GenerationBackend) interface on a
//! dedicated rayon thread pool: every partition of a split is generated and
//! written by one worker, and the per-partition shard lists are handed back to
//! the builder for merging.

#![warn(missing_docs)]

pub mod error;
pub mod local;

pub use error::{Error, Result};
pub use local::{LocalBackendOptions, LocalParallelBackend};
