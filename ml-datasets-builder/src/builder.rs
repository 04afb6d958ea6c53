//! Dataset builder orchestration
//!
//! A [`DatasetBuilder`] drives a [`DatasetScript`] through
//! `Uninitialized → DataAcquired → SplitsGenerating → SplitsWritten → Ready`.
//! All output is written into a process-unique staging directory next to the
//! final `<cache>/<name>/<config>/<version>` directory and renamed into place
//! once the splits and `dataset_info.json` are complete. Concurrent builders
//! of the same dataset resolve the race through that rename: the loser keeps
//! the winner's output when both produced the same split sizes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ml_datasets_core::io::StagedPath;
use ml_datasets_core::shard::shard_paths;
use ml_datasets_core::{
    ExampleIter, Features, PartitionedGenerator, ShardWriter, SplitGenerationJob, Table, Value,
};
use uuid::Uuid;

use crate::config::{BuilderOptions, GenerateMode};
use crate::download::{verify_checksums, DownloadManager, LocalDownloadManager};
use crate::error::{AcquisitionError, CleanupOutcome, Error, Result};
use crate::info::{BuilderConfig, DatasetInfo, DATASET_INFO_FILENAME};
use crate::naming::{camelcase_to_snakecase, filename_prefix_for_split, is_valid_split_name, type_basename};
use crate::split_expr::ReadInstruction;
use crate::splits::{SplitInfo, SplitRegistry};

/// How a script produces its examples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    /// In-process iterator per split
    Local,
    /// Partitions submitted to a generation backend
    Distributed,
}

/// One split declared by a script, with the arguments its generator needs
#[derive(Debug, Clone, PartialEq)]
pub struct SplitGenerator {
    /// Split name
    pub name: String,

    /// Generator arguments, typically acquired file paths
    pub args: BTreeMap<String, Value>,
}

impl SplitGenerator {
    /// Split without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Dataset-specific logic: what the data looks like and how to produce it
pub trait DatasetScript: Send + Sync {
    /// Snake-case builder name; derived from the type name by default
    fn name(&self) -> String {
        camelcase_to_snakecase(type_basename(std::any::type_name::<Self>()))
    }

    /// Schema and descriptive metadata. Declared `splits` and
    /// `download_checksums` are verified against the build.
    fn info(&self) -> DatasetInfo;

    /// Config variant being built
    fn config(&self) -> BuilderConfig {
        BuilderConfig::default()
    }

    /// Local or distributed generation
    fn generation_kind(&self) -> GenerationKind {
        GenerationKind::Local
    }

    /// Acquire raw data and declare the splits
    fn split_generators(&self, downloads: &dyn DownloadManager) -> anyhow::Result<Vec<SplitGenerator>>;

    /// Examples of a split, in order, for local generation
    fn generate_examples(&self, split: &SplitGenerator) -> anyhow::Result<ExampleIter<'_>> {
        anyhow::bail!("{} does not generate split {} locally", self.name(), split.name)
    }

    /// Partitioned source of a split, for distributed generation
    fn partitions(&self, split: &SplitGenerator) -> anyhow::Result<Arc<dyn PartitionedGenerator>> {
        anyhow::bail!("{} has no partitioned generator for split {}", self.name(), split.name)
    }
}

/// Progress of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Nothing done yet
    Uninitialized,
    /// Raw data acquired and splits declared
    DataAcquired,
    /// Splits being generated
    SplitsGenerating,
    /// Every split written
    SplitsWritten,
    /// Tables available
    Ready,
    /// The last build failed
    Failed,
}

/// Outcome of [`DatasetBuilder::download_and_prepare`]
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    /// Directory holding the dataset
    pub data_dir: PathBuf,

    /// An existing build was reused without generation
    pub reused: bool,

    /// Built splits
    pub splits: SplitRegistry,

    /// Splits skipped after failing in a partial build
    pub failed_splits: Vec<String>,
}

/// Builds a dataset into the cache and exposes its splits as tables
pub struct DatasetBuilder<S> {
    script: S,
    options: BuilderOptions,
    downloads: Arc<dyn DownloadManager>,
    name: String,
    config: BuilderConfig,
    info: DatasetInfo,
    state: BuildState,
}

impl<S: DatasetScript> DatasetBuilder<S> {
    /// Builder over the cache in `options`. A complete build already in the
    /// cache makes the builder `Ready` immediately.
    pub fn new(script: S, options: BuilderOptions) -> Result<Self> {
        let name = script.name();
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::InvalidConfig(format!("invalid dataset name {name:?}")));
        }
        let config = script.config();
        let info = script.info();

        let mut builder = Self {
            script,
            options,
            downloads: Arc::new(LocalDownloadManager::new()),
            name,
            config,
            info,
            state: BuildState::Uninitialized,
        };
        if let Some(existing) = builder.existing_info()? {
            if builder.is_compatible(&existing) {
                builder.info = existing;
                builder.state = BuildState::Ready;
            } else {
                tracing::warn!(
                    dir = %builder.data_dir().display(),
                    "cached dataset was built with different features, not reusing it"
                );
            }
        }
        Ok(builder)
    }

    /// Use another acquisition collaborator
    #[must_use]
    pub fn with_download_manager(mut self, downloads: Arc<dyn DownloadManager>) -> Self {
        self.downloads = downloads;
        self
    }

    /// Snake-case dataset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Config being built
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Metadata; complete once the builder is `Ready`
    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    /// `<cache_dir>/<name>/<config>/<version>`
    pub fn data_dir(&self) -> PathBuf {
        self.options
            .cache_dir
            .join(&self.name)
            .join(&self.config.name)
            .join(self.config.version.to_string())
    }

    fn existing_info(&self) -> Result<Option<DatasetInfo>> {
        let dir = self.data_dir();
        if !dir.join(DATASET_INFO_FILENAME).is_file() {
            return Ok(None);
        }
        Ok(Some(DatasetInfo::from_directory(&dir)?))
    }

    /// A cached build is only served when it was recorded for this dataset
    /// identity with exactly the features the script declares.
    fn is_compatible(&self, existing: &DatasetInfo) -> bool {
        existing.builder_name == self.name
            && existing.config_name == self.config.name
            && existing.version == self.config.version
            && existing.features == self.script.info().features
    }

    fn incompatible(&self, existing: &DatasetInfo) -> Error {
        Error::Core(ml_datasets_core::Error::SchemaVersionMismatch {
            path: self.data_dir().join(DATASET_INFO_FILENAME),
            expected: format!(
                "{}/{}/{} with {}",
                self.name,
                self.config.name,
                self.config.version,
                self.script.info().features
            ),
            found: format!(
                "{}/{}/{} with {}",
                existing.builder_name, existing.config_name, existing.version, existing.features
            ),
        })
    }

    fn transition(&mut self, next: BuildState) {
        tracing::info!(from = ?self.state, to = ?next, "build state transition");
        self.state = next;
    }

    /// Acquire data, generate every split and publish the dataset.
    ///
    /// A distributed script without a configured backend fails with
    /// [`Error::MissingGenerationConfig`] before anything is written. Failures
    /// after output was staged are reported as [`Error::Build`] once the
    /// staged output has been removed.
    pub fn download_and_prepare(&mut self) -> Result<BuildReport> {
        let span = tracing::info_span!(
            "download_and_prepare",
            dataset = %self.name,
            config = %self.config.name
        );
        let _entered = span.enter();

        let result = self.prepare();
        if result.is_err() {
            self.transition(BuildState::Failed);
        }
        result
    }

    fn prepare(&mut self) -> Result<BuildReport> {
        let kind = self.script.generation_kind();
        if kind == GenerationKind::Distributed && self.options.backend.is_none() {
            return Err(Error::MissingGenerationConfig {
                dataset: self.name.clone(),
            });
        }

        let data_dir = self.data_dir();
        if self.options.generate_mode == GenerateMode::ReuseDatasetIfExists {
            if let Some(existing) = self.existing_info()? {
                if !self.is_compatible(&existing) {
                    return Err(self.incompatible(&existing));
                }
                tracing::info!(dir = %data_dir.display(), "reusing existing dataset");
                self.info = existing;
                self.transition(BuildState::Ready);
                return Ok(self.report(data_dir, true, Vec::new()));
            }
        }

        let generators = self.acquire()?;

        let parent = data_dir
            .parent()
            .ok_or_else(|| Error::InvalidConfig(format!("{} has no parent", data_dir.display())))?;
        fs::create_dir_all(parent)?;
        let staged_dir = parent.join(format!(
            "{}.incomplete-{}",
            self.config.version,
            Uuid::new_v4().simple()
        ));
        fs::create_dir(&staged_dir)?;
        let mut staged = StagedPath::new(staged_dir);

        let (info, failed) = match self.write_splits(kind, &generators, staged.path()) {
            Ok(built) => built,
            Err((source, failed_splits)) => {
                staged.disarm();
                return Err(Error::Build {
                    source: Box::new(source),
                    failed_splits,
                    cleanup: remove_staged(staged.path()),
                });
            }
        };

        self.info = match self.publish(info, &mut staged, &data_dir) {
            Ok(published) => published,
            Err(source) => {
                staged.disarm();
                return Err(Error::Build {
                    source: Box::new(source),
                    failed_splits: failed,
                    cleanup: remove_staged(staged.path()),
                });
            }
        };
        drop(staged);
        self.transition(BuildState::Ready);
        Ok(self.report(data_dir, false, failed))
    }

    fn report(&self, data_dir: PathBuf, reused: bool, failed_splits: Vec<String>) -> BuildReport {
        BuildReport {
            data_dir,
            reused,
            splits: self.info.splits.clone(),
            failed_splits,
        }
    }

    fn acquire(&mut self) -> Result<Vec<SplitGenerator>> {
        let generators = self
            .script
            .split_generators(self.downloads.as_ref())
            .map_err(|err| match err.downcast::<AcquisitionError>() {
                Ok(acquisition) => Error::Acquisition(acquisition),
                Err(other) => Error::Script {
                    stage: "split_generators",
                    source: other,
                },
            })?;

        let declared = self.script.info().download_checksums;
        if !declared.is_empty() {
            verify_checksums(&declared, &self.downloads.recorded_checksums())?;
        }

        let mut seen = Vec::with_capacity(generators.len());
        for generator in &generators {
            if !is_valid_split_name(&generator.name) || seen.contains(&generator.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "invalid or duplicate split name {:?}",
                    generator.name
                )));
            }
            seen.push(generator.name.as_str());
        }

        self.transition(BuildState::DataAcquired);
        Ok(generators)
    }

    /// Generate every split into `dir` and assemble the dataset info.
    /// Errors carry the names of the splits that failed.
    fn write_splits(
        &mut self,
        kind: GenerationKind,
        generators: &[SplitGenerator],
        dir: &Path,
    ) -> std::result::Result<(DatasetInfo, Vec<String>), (Error, Vec<String>)> {
        self.transition(BuildState::SplitsGenerating);
        let declared = self.script.info();

        let mut registry = SplitRegistry::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for generator in generators {
            match self.generate_split(kind, generator, &declared.features, dir) {
                Ok(split) => {
                    tracing::info!(
                        split = %split.name,
                        rows = split.num_examples,
                        shards = split.num_shards(),
                        "split written"
                    );
                    registry.add(split);
                }
                Err(err) => {
                    tracing::warn!(split = %generator.name, error = %err, "split generation failed");
                    failed.push(generator.name.clone());
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            if !self.options.allow_partial_builds || registry.is_empty() {
                return Err((err, failed));
            }
        }
        self.transition(BuildState::SplitsWritten);

        if !declared.splits.is_empty() {
            registry
                .verify(&declared.splits, &failed)
                .map_err(|err| (err, failed.clone()))?;
        }

        let mut info = declared;
        info.builder_name = self.name.clone();
        info.config_name = self.config.name.clone();
        info.version = self.config.version;
        info.splits = registry;
        info.download_checksums = self.downloads.recorded_checksums();
        info.generation_fingerprint = self
            .generation_fingerprint(&info.features, generators)
            .map_err(|err| (err, failed.clone()))?;
        info.update_sizes();
        info.write_to_directory(dir).map_err(|err| (err, failed.clone()))?;
        Ok((info, failed))
    }

    fn generate_split(
        &self,
        kind: GenerationKind,
        generator: &SplitGenerator,
        features: &Features,
        dir: &Path,
    ) -> Result<SplitInfo> {
        let features = features.clone();
        match kind {
            GenerationKind::Local => {
                let mut writer = ShardWriter::new(
                    dir,
                    &filename_prefix_for_split(&self.name, &generator.name),
                    features,
                    self.options.writer.clone(),
                )?;
                let examples = self
                    .script
                    .generate_examples(generator)
                    .map_err(ml_datasets_core::Error::Generation)?;
                for example in examples {
                    writer.write(&example.map_err(ml_datasets_core::Error::Generation)?)?;
                }
                let summary = writer.finish()?;
                Ok(SplitInfo::from_shards(&generator.name, summary.shards))
            }
            GenerationKind::Distributed => {
                let backend = self
                    .options
                    .backend
                    .as_ref()
                    .ok_or_else(|| Error::MissingGenerationConfig {
                        dataset: self.name.clone(),
                    })?;
                let source = self.script.partitions(generator).map_err(|err| Error::Script {
                    stage: "partitions",
                    source: err,
                })?;
                let job = SplitGenerationJob {
                    dataset: self.name.clone(),
                    split: generator.name.clone(),
                    features,
                    output_dir: dir.to_path_buf(),
                    writer: self.options.writer.clone(),
                    generator: source,
                };
                tracing::debug!(backend = backend.name(), ?job, "submitting split");

                let mut split = SplitInfo::new(&generator.name);
                for partition in backend.submit_partitioned_generation(&job)? {
                    split.merge_partition(partition);
                }
                Ok(split)
            }
        }
    }

    fn generation_fingerprint(&self, features: &Features, generators: &[SplitGenerator]) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ml-datasets/generation/v1");
        for part in [&self.name, &self.config.name, &self.config.version.to_string()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(&features.serialize()?);
        for generator in generators {
            hasher.update(generator.name.as_bytes());
            hasher.update(&serde_json::to_vec(&generator.args)?);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Rename the staged directory into place. Returns the info of the
    /// published dataset, which is the concurrent winner's when we lost.
    fn publish(&self, info: DatasetInfo, staged: &mut StagedPath, data_dir: &Path) -> Result<DatasetInfo> {
        let mut replaced = None;
        if self.options.generate_mode == GenerateMode::ForceRedownload && data_dir.exists() {
            let aside = data_dir.with_file_name(format!(
                "{}.replaced-{}",
                self.config.version,
                Uuid::new_v4().simple()
            ));
            fs::rename(data_dir, &aside)?;
            replaced = Some(StagedPath::new(aside));
        }

        match fs::rename(staged.path(), data_dir) {
            Ok(()) => {
                staged.disarm();
                tracing::info!(
                    dir = %data_dir.display(),
                    rows = info.splits.total_num_examples(),
                    replaced = replaced.is_some(),
                    "published dataset"
                );
                Ok(info)
            }
            Err(err) if replaced.is_none() && data_dir.join(DATASET_INFO_FILENAME).is_file() => {
                let winner = DatasetInfo::from_directory(data_dir)?;
                if winner.features != info.features
                    || winner.generation_fingerprint != info.generation_fingerprint
                    || !winner.splits.same_sizes(&info.splits)
                {
                    return Err(Error::ConflictingBuild {
                        path: data_dir.to_path_buf(),
                    });
                }
                tracing::info!(
                    dir = %data_dir.display(),
                    error = %err,
                    "concurrent build published first, adopting its output"
                );
                Ok(winner)
            }
            Err(err) => {
                if let Some(mut aside) = replaced {
                    if fs::rename(aside.path(), data_dir).is_ok() {
                        aside.disarm();
                    }
                }
                Err(err.into())
            }
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == BuildState::Ready {
            Ok(())
        } else {
            Err(Error::NotReady {
                dataset: self.name.clone(),
            })
        }
    }

    fn split_table(&self, split: &SplitInfo) -> Result<Table> {
        let paths = shard_paths(&self.data_dir(), &split.shards);
        let table = if self.options.verify_shards {
            Table::open_verified(&self.info.features, &paths)?
        } else {
            Table::open(&self.info.features, &paths)?
        };
        Ok(table)
    }

    /// Table for a split expression, or all splits concatenated in name
    /// order when `split` is `None`
    pub fn as_dataset(&self, split: Option<&str>) -> Result<Table> {
        self.ensure_ready()?;
        let instruction = match split {
            Some(expression) => expression.parse::<ReadInstruction>()?,
            None => self
                .info
                .splits
                .names()
                .into_iter()
                .map(ReadInstruction::split)
                .reduce(|acc, next| acc + next)
                .ok_or_else(|| Error::NotReady {
                    dataset: self.name.clone(),
                })?,
        };

        let tables = instruction
            .to_absolute(&self.info.splits)?
            .into_iter()
            .map(|part| {
                let table = self.split_table(self.info.splits.require(&part.split)?)?;
                Ok(table.slice(part.rows)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Table::concat(&tables)?)
    }

    /// One table per split
    pub fn as_dataset_dict(&self) -> Result<BTreeMap<String, Table>> {
        self.ensure_ready()?;
        self.info
            .splits
            .iter()
            .map(|split| Ok((split.name.clone(), self.split_table(split)?)))
            .collect()
    }
}

fn remove_staged(path: &Path) -> CleanupOutcome {
    match fs::remove_dir_all(path) {
        Ok(()) => CleanupOutcome::Removed,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => CleanupOutcome::Removed,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove staged build");
            CleanupOutcome::Incomplete {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
    }
}
