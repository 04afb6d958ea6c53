//! Dataset builder orchestration, split registry and dataset metadata
//!
//! A [`DatasetScript`] describes a dataset: its [`DatasetInfo`], how raw data
//! is acquired through a [`DownloadManager`], and how examples are generated,
//! either locally or as partitions submitted to a
//! [`GenerationBackend`](ml_datasets_core::GenerationBackend). The
//! [`DatasetBuilder`] turns a script into immutable shard files in the cache,
//! records every split in a [`SplitRegistry`] and serves the splits back as
//! memory-mapped tables, optionally sliced by a [`ReadInstruction`].

#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod download;
pub mod error;
pub mod info;
pub mod naming;
pub mod split_expr;
pub mod splits;

pub use builder::{
    BuildReport, BuildState, DatasetBuilder, DatasetScript, GenerationKind, SplitGenerator,
};
pub use config::{BuilderOptions, GenerateMode};
pub use download::{DownloadManager, LocalDownloadManager};
pub use error::{AcquisitionError, CleanupOutcome, Error, Result};
pub use info::{BuilderConfig, DatasetInfo, DownloadChecksum, SupervisedKeys, Version};
pub use split_expr::{ReadInstruction, Rounding};
pub use splits::{SplitInfo, SplitRegistry};
