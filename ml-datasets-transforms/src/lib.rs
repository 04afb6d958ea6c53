//! Fingerprint-cached transformations over ML dataset tables
//!
//! Every materializing operation of the [`Pipeline`] is keyed by a
//! [`Fingerprint`] of its input table, its arguments and the [`FunctionId`] of
//! any user function. Results are stored as shard files in a
//! [`FingerprintCache`], so re-running the same transformation over the same
//! input reuses the stored shards instead of recomputing them.

#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod pipeline;

pub use cache::{CacheManifest, CacheStats, FingerprintCache, Materialized};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, FingerprintBuilder, FunctionId};
pub use pipeline::{
    permutation, MapOptions, Pipeline, PipelineOptions, SplitSize, TrainTestSplit,
    TrainTestSplitOptions,
};
