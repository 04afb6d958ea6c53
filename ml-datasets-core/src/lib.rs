//! Feature schemas, columnar shards and memory-mapped tables for ML datasets
//!
//! This crate holds the storage half of the dataset engine: the typed
//! [`Features`] schema that validates dynamically-typed [`Value`]s, the
//! struct-of-arrays [`PhysicalLayout`] derived from it, the [`ShardWriter`] that
//! publishes immutable shard files, and the [`Table`] that maps them back for
//! random access. It also defines the [`GenerationBackend`] interface used for
//! data-parallel split generation.

#![warn(missing_docs)]

pub mod backend;
pub mod column;
pub mod error;
pub mod features;
pub mod io;
pub mod layout;
pub mod shard;
pub mod table;
pub mod value;
pub mod writer;

// Re-export key types for convenience
pub use backend::{
    write_partition, ExampleIter, GenerationBackend, PartitionResult, PartitionResults,
    PartitionedGenerator, SplitGenerationJob,
};
pub use column::{ColumnBatch, ColumnSource};
pub use error::{Error, Result};
pub use features::{
    ClassLabel, FeatureSpec, Features, Field, ScalarKind, Translation,
    TranslationVariableLanguages,
};
pub use layout::PhysicalLayout;
pub use shard::{Shard, ShardFileInfo};
pub use table::{ColumnView, NativeType, Table};
pub use value::{Example, Value};
pub use writer::{ShardWriter, WriteSummary, WriterOptions};
