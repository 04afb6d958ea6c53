//! Thread-pool generation backend

use std::fs;

use ml_datasets_core::shard::shard_paths;
use ml_datasets_core::{
    write_partition, GenerationBackend, PartitionResult, PartitionResults, SplitGenerationJob,
};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Error, Result};

/// Configuration for [`LocalParallelBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBackendOptions {
    /// Number of worker threads
    pub num_workers: usize,
}

impl Default for LocalBackendOptions {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
        }
    }
}

/// Runs the partitions of a split on a local worker pool
#[derive(Debug)]
pub struct LocalParallelBackend {
    pool: ThreadPool,
    options: LocalBackendOptions,
}

impl LocalParallelBackend {
    /// Start a backend with its own pool of `options.num_workers` threads
    pub fn new(options: LocalBackendOptions) -> Result<Self> {
        if options.num_workers == 0 {
            return Err(Error::InvalidArgument("num_workers must be positive".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.num_workers)
            .thread_name(|i| format!("ml-datasets-worker-{i}"))
            .build()?;
        tracing::debug!(workers = options.num_workers, "started local generation backend");
        Ok(Self { pool, options })
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.options.num_workers
    }
}

fn discard(job: &SplitGenerationJob, result: &PartitionResult) {
    for path in shard_paths(&job.output_dir, &result.shards) {
        if let Err(err) = fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove partition shard");
        }
    }
}

impl GenerationBackend for LocalParallelBackend {
    fn name(&self) -> &str {
        "local"
    }

    /// Generate all partitions concurrently. If any partition fails, the
    /// shards of the partitions that succeeded are removed and the error of
    /// the lowest failing partition is returned.
    fn submit_partitioned_generation(
        &self,
        job: &SplitGenerationJob,
    ) -> ml_datasets_core::Result<PartitionResults> {
        let partitions = job.generator.num_partitions();
        tracing::info!(
            split = %job.split,
            partitions,
            workers = self.options.num_workers,
            "submitting partitioned generation"
        );

        let outcomes: Vec<ml_datasets_core::Result<PartitionResult>> = self.pool.install(|| {
            (0..partitions)
                .into_par_iter()
                .map(|partition| write_partition(job, partition))
                .collect()
        });

        if outcomes.iter().all(std::result::Result::is_ok) {
            return outcomes.into_iter().collect();
        }

        let mut first_error = None;
        let mut failed = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(result) => discard(job, &result),
                Err(err) => {
                    failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }
        tracing::warn!(split = %job.split, failed, partitions, "partitioned generation failed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(PartitionResults::new()),
        }
    }
}
