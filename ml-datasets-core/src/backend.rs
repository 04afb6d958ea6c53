//! Interface to data-parallel generation backends
//!
//! A backend receives a [`SplitGenerationJob`] describing one split, runs its
//! partitions however it likes (threads, processes, remote workers) and
//! reports the shard files each partition produced.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::Features;
use crate::shard::ShardFileInfo;
use crate::value::Example;
use crate::writer::{ShardWriter, WriterOptions};

/// Iterator of generated examples for one partition
pub type ExampleIter<'a> = Box<dyn Iterator<Item = anyhow::Result<Example>> + Send + 'a>;

/// A split's example source, divided into independently generated partitions
pub trait PartitionedGenerator: Send + Sync {
    /// Number of partitions
    fn num_partitions(&self) -> usize;

    /// Examples of one partition, in order
    fn generate_partition(&self, partition: usize) -> anyhow::Result<ExampleIter<'_>>;
}

/// Everything a backend needs to generate one split
#[derive(Clone)]
pub struct SplitGenerationJob {
    /// Dataset name, used in shard file prefixes
    pub dataset: String,

    /// Split name
    pub split: String,

    /// Schema of the generated examples
    pub features: Features,

    /// Directory receiving the shard files
    pub output_dir: PathBuf,

    /// Writer configuration for each partition
    pub writer: WriterOptions,

    /// Example source
    pub generator: Arc<dyn PartitionedGenerator>,
}

impl fmt::Debug for SplitGenerationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitGenerationJob")
            .field("dataset", &self.dataset)
            .field("split", &self.split)
            .field("output_dir", &self.output_dir)
            .field("partitions", &self.generator.num_partitions())
            .finish_non_exhaustive()
    }
}

impl SplitGenerationJob {
    /// Shard file prefix for a partition: `<dataset>-<split>-p<NNNNN>`
    pub fn partition_prefix(&self, partition: usize) -> String {
        format!("{}-{}-p{partition:05}", self.dataset, self.split)
    }
}

/// Output of one generated partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionResult {
    /// Partition index
    pub partition: usize,

    /// Rows written
    pub num_rows: u64,

    /// Bytes written
    pub num_bytes: u64,

    /// Shards in row order
    pub shards: Vec<ShardFileInfo>,
}

/// Results of every partition of a split, in any order
pub type PartitionResults = Vec<PartitionResult>;

/// A data-parallel execution engine for split generation
pub trait GenerationBackend: Send + Sync {
    /// Name for logs and metadata
    fn name(&self) -> &str;

    /// Generate every partition of the job and report the produced shards
    fn submit_partitioned_generation(&self, job: &SplitGenerationJob) -> Result<PartitionResults>;
}

/// Generate one partition and write it through a [`ShardWriter`].
///
/// Generation errors abort the partition; shards it already flushed are
/// removed when the writer is dropped.
pub fn write_partition(job: &SplitGenerationJob, partition: usize) -> Result<PartitionResult> {
    let mut writer = ShardWriter::new(
        &job.output_dir,
        &job.partition_prefix(partition),
        job.features.clone(),
        job.writer.clone(),
    )?;

    let examples = job
        .generator
        .generate_partition(partition)
        .map_err(Error::Generation)?;
    for example in examples {
        writer.write(&example.map_err(Error::Generation)?)?;
    }

    let summary = writer.finish()?;
    tracing::debug!(
        split = %job.split,
        partition,
        rows = summary.num_rows,
        "partition complete"
    );
    Ok(PartitionResult {
        partition,
        num_rows: summary.num_rows,
        num_bytes: summary.num_bytes,
        shards: summary.shards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example;
    use crate::features::{FeatureSpec, ScalarKind};
    use tempfile::tempdir;

    struct Numbers {
        fail_at: Option<usize>,
    }

    impl PartitionedGenerator for Numbers {
        fn num_partitions(&self) -> usize {
            2
        }

        fn generate_partition(&self, partition: usize) -> anyhow::Result<ExampleIter<'_>> {
            let fail_at = self.fail_at;
            Ok(Box::new((0..3).map(move |i| {
                if fail_at == Some(i) {
                    anyhow::bail!("generator failed at {i}");
                }
                Ok(example! { "n" => (partition * 10 + i) as i64 })
            })))
        }
    }

    fn job(dir: PathBuf, fail_at: Option<usize>) -> SplitGenerationJob {
        SplitGenerationJob {
            dataset: "numbers".into(),
            split: "train".into(),
            features: Features::from_pairs([("n", FeatureSpec::Scalar(ScalarKind::Int64))]).unwrap(),
            output_dir: dir,
            writer: WriterOptions { batch_size: 2 },
            generator: Arc::new(Numbers { fail_at }),
        }
    }

    #[test]
    fn partition_output_is_namespaced() {
        let dir = tempdir().unwrap();
        let result = write_partition(&job(dir.path().to_path_buf(), None), 1).unwrap();
        assert_eq!(result.num_rows, 3);
        assert_eq!(result.shards[0].file_name, "numbers-train-p00001-00000.shard");
        assert_eq!(result.shards.len(), 2);
    }

    #[test]
    fn generator_error_leaves_no_shards() {
        let dir = tempdir().unwrap();
        let err = write_partition(&job(dir.path().to_path_buf(), Some(2)), 0).unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
