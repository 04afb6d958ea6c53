use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::SystemTime;

use ml_datasets_builder::{
    BuildState, BuilderOptions, CleanupOutcome, DatasetBuilder, DatasetInfo, DatasetScript,
    DownloadManager, Error, GenerateMode, GenerationKind, SplitGenerator,
};
use ml_datasets_core::{
    example, Example, ExampleIter, FeatureSpec, Features, PartitionedGenerator, ScalarKind, Value,
};
use ml_datasets_parallel::LocalBackendOptions;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct InMemoryPartitions {
    examples: Vec<Example>,
    partitions: usize,
}

impl PartitionedGenerator for InMemoryPartitions {
    fn num_partitions(&self) -> usize {
        self.partitions
    }

    fn generate_partition(&self, partition: usize) -> anyhow::Result<ExampleIter<'_>> {
        let chunk = self.examples.len().div_ceil(self.partitions);
        let start = (partition * chunk).min(self.examples.len());
        let end = (start + chunk).min(self.examples.len());
        Ok(Box::new(
            self.examples[start..end].iter().cloned().map(Ok::<_, anyhow::Error>),
        ))
    }
}

fn dummy_examples() -> Vec<Example> {
    ["foo", "bar", "foobar"]
        .into_iter()
        .map(|content| example! { "content" => content })
        .collect()
}

fn nested_examples() -> Vec<Example> {
    let base: Vec<Example> = ["foo", "bar", "foobar"]
        .into_iter()
        .map(|content| {
            example! { "a" => Value::map([("b", Value::List(vec![Value::from(content)]))]) }
        })
        .collect();
    base.iter().cloned().cycle().take(base.len() * 10_000).collect()
}

struct DummyBeamDataset;

impl DatasetScript for DummyBeamDataset {
    fn info(&self) -> DatasetInfo {
        DatasetInfo::new(
            Features::from_pairs([("content", FeatureSpec::Scalar(ScalarKind::String))]).unwrap(),
        )
    }

    fn generation_kind(&self) -> GenerationKind {
        GenerationKind::Distributed
    }

    fn split_generators(&self, _: &dyn DownloadManager) -> anyhow::Result<Vec<SplitGenerator>> {
        Ok(vec![SplitGenerator::new("train")])
    }

    fn partitions(&self, _: &SplitGenerator) -> anyhow::Result<Arc<dyn PartitionedGenerator>> {
        Ok(Arc::new(InMemoryPartitions {
            examples: dummy_examples(),
            partitions: 2,
        }))
    }
}

struct NestedBeamDataset;

impl DatasetScript for NestedBeamDataset {
    fn info(&self) -> DatasetInfo {
        DatasetInfo::new(
            Features::from_pairs([(
                "a",
                FeatureSpec::sequence(FeatureSpec::structure([(
                    "b",
                    FeatureSpec::Scalar(ScalarKind::String),
                )])),
            )])
            .unwrap(),
        )
    }

    fn generation_kind(&self) -> GenerationKind {
        GenerationKind::Distributed
    }

    fn split_generators(&self, _: &dyn DownloadManager) -> anyhow::Result<Vec<SplitGenerator>> {
        Ok(vec![SplitGenerator::new("train")])
    }

    fn partitions(&self, _: &SplitGenerator) -> anyhow::Result<Arc<dyn PartitionedGenerator>> {
        Ok(Arc::new(InMemoryPartitions {
            examples: nested_examples(),
            partitions: 4,
        }))
    }
}

/// Local dataset with a train and a test split; test can be made to fail
struct TwoSplits {
    fail_test: bool,
}

impl DatasetScript for TwoSplits {
    fn info(&self) -> DatasetInfo {
        DatasetInfo::new(Features::from_pairs([("n", FeatureSpec::Scalar(ScalarKind::Int64))]).unwrap())
    }

    fn split_generators(&self, _: &dyn DownloadManager) -> anyhow::Result<Vec<SplitGenerator>> {
        Ok(vec![
            SplitGenerator::new("train").with_arg("rows", 8),
            SplitGenerator::new("test").with_arg("rows", 2),
        ])
    }

    fn generate_examples(&self, split: &SplitGenerator) -> anyhow::Result<ExampleIter<'_>> {
        let rows = split.args["rows"].as_int().unwrap_or(0);
        let fail = self.fail_test && split.name == "test";
        Ok(Box::new((0..rows).map(move |n| {
            anyhow::ensure!(!(fail && n == 1), "row {n} of the test split is corrupt");
            Ok(example! { "n" => n })
        })))
    }
}

/// Local dataset whose single column changes type with `kind`
struct Counter {
    kind: ScalarKind,
}

impl DatasetScript for Counter {
    fn info(&self) -> DatasetInfo {
        DatasetInfo::new(Features::from_pairs([("n", FeatureSpec::Scalar(self.kind))]).unwrap())
    }

    fn split_generators(&self, _: &dyn DownloadManager) -> anyhow::Result<Vec<SplitGenerator>> {
        Ok(vec![SplitGenerator::new("train")])
    }

    fn generate_examples(&self, _: &SplitGenerator) -> anyhow::Result<ExampleIter<'_>> {
        let kind = self.kind;
        Ok(Box::new((0..4i64).map(move |n| {
            Ok::<_, anyhow::Error>(match kind {
                ScalarKind::String => example! { "n" => n.to_string() },
                _ => example! { "n" => n },
            })
        })))
    }
}

fn local_backend(cache: &Path) -> BuilderOptions {
    BuilderOptions::new(cache)
        .with_local_backend(LocalBackendOptions { num_workers: 2 })
        .unwrap()
}

fn shard_mtimes(dir: &Path) -> BTreeMap<String, SystemTime> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".shard"))
        .map(|entry| {
            (
                entry.file_name().to_string_lossy().into_owned(),
                entry.metadata().unwrap().modified().unwrap(),
            )
        })
        .collect()
}

#[test]
fn builds_dummy_dataset_through_backend() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut builder = DatasetBuilder::new(DummyBeamDataset, local_backend(cache.path())).unwrap();

    builder.download_and_prepare().unwrap();
    assert_eq!(builder.state(), BuildState::Ready);

    let datasets = builder.as_dataset_dict().unwrap();
    let train = &datasets["train"];
    assert_eq!(train.num_rows(), 3);
    assert_eq!(builder.info().splits.get("train").unwrap().num_examples, 3);
    assert_eq!(train.row(0).unwrap(), example! { "content" => "foo" });
    assert_eq!(train.row(2).unwrap(), example! { "content" => "foobar" });
    assert!(cache
        .path()
        .join("dummy_beam_dataset")
        .join("default")
        .join("0.0.0")
        .join("dataset_info.json")
        .is_file());

    let everything = builder.as_dataset(None).unwrap();
    assert_eq!(everything.num_rows(), 3);
}

#[test]
fn builds_nested_features_from_partitions() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut builder = DatasetBuilder::new(NestedBeamDataset, local_backend(cache.path())).unwrap();

    builder.download_and_prepare().unwrap();
    let train = builder.as_dataset(Some("train")).unwrap();
    let expected = nested_examples();

    assert_eq!(train.num_rows(), 30_000);
    assert_eq!(builder.info().splits.get("train").unwrap().num_examples, 30_000);
    assert_eq!(train.row(0).unwrap(), expected[0]);
    assert_eq!(train.row(29_999).unwrap(), expected[29_999]);
    assert!(cache
        .path()
        .join("nested_beam_dataset/default/0.0.0/dataset_info.json")
        .is_file());
}

#[test]
fn distributed_split_without_backend_fails_fast() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut builder = DatasetBuilder::new(DummyBeamDataset, BuilderOptions::new(cache.path())).unwrap();

    let err = builder.download_and_prepare().unwrap_err();
    assert!(matches!(err.root(), Error::MissingGenerationConfig { .. }), "{err}");
    assert_eq!(builder.state(), BuildState::Failed);
    assert_eq!(fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[test]
fn second_build_reuses_existing_output() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut first = DatasetBuilder::new(TwoSplits { fail_test: false }, BuilderOptions::new(cache.path())).unwrap();
    let built = first.download_and_prepare().unwrap();
    assert!(!built.reused);
    let before = shard_mtimes(&built.data_dir);
    assert_eq!(before.len(), 2);

    let mut second = DatasetBuilder::new(TwoSplits { fail_test: false }, BuilderOptions::new(cache.path())).unwrap();
    assert_eq!(second.state(), BuildState::Ready);
    let reused = second.download_and_prepare().unwrap();

    assert!(reused.reused);
    assert_eq!(reused.splits, built.splits);
    assert!(second.as_dataset(Some("train")).is_ok());
    assert_eq!(shard_mtimes(&reused.data_dir), before);
    assert_eq!(second.as_dataset(Some("train[:50%]+test")).unwrap().num_rows(), 6);
}

#[test]
fn failed_split_aborts_and_cleans_up() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut builder = DatasetBuilder::new(TwoSplits { fail_test: true }, BuilderOptions::new(cache.path())).unwrap();

    let err = builder.download_and_prepare().unwrap_err();
    match &err {
        Error::Build {
            failed_splits,
            cleanup,
            ..
        } => {
            assert_eq!(failed_splits, &["test".to_string()]);
            assert_eq!(cleanup, &CleanupOutcome::Removed);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(matches!(err.root(), Error::Core(ml_datasets_core::Error::Generation(_))));

    let config_dir = cache.path().join("two_splits").join("default");
    assert_eq!(fs::read_dir(&config_dir).unwrap().count(), 0);
    assert!(matches!(builder.as_dataset(None), Err(Error::NotReady { .. })));
}

#[test]
fn partial_build_keeps_successful_splits() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut options = BuilderOptions::new(cache.path());
    options.allow_partial_builds = true;
    let mut builder = DatasetBuilder::new(TwoSplits { fail_test: true }, options).unwrap();

    let report = builder.download_and_prepare().unwrap();
    assert_eq!(report.failed_splits, vec!["test".to_string()]);
    assert_eq!(report.splits.names(), vec!["train"]);
    assert_eq!(builder.as_dataset(Some("train")).unwrap().num_rows(), 8);
    assert!(builder.as_dataset(Some("test")).is_err());
}

#[test]
fn concurrent_builds_converge() {
    init_tracing();
    let cache = tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let dir = cache.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut builder = DatasetBuilder::new(DummyBeamDataset, local_backend(&dir)).unwrap();
                barrier.wait();
                let report = builder.download_and_prepare().unwrap();
                let rows = builder.as_dataset(None).unwrap().num_rows();
                (report.splits, rows)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].1, 3);

    let config_dir = cache.path().join("dummy_beam_dataset").join("default");
    let entries: Vec<_> = fs::read_dir(&config_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["0.0.0".to_string()]);
}

#[test]
fn changed_features_are_not_served_from_cache() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut ints = DatasetBuilder::new(Counter { kind: ScalarKind::Int64 }, BuilderOptions::new(cache.path())).unwrap();
    let built = ints.download_and_prepare().unwrap();
    let before = shard_mtimes(&built.data_dir);

    let mut strings =
        DatasetBuilder::new(Counter { kind: ScalarKind::String }, BuilderOptions::new(cache.path())).unwrap();
    assert_eq!(strings.state(), BuildState::Uninitialized);
    assert!(matches!(strings.as_dataset(None), Err(Error::NotReady { .. })));

    let err = strings.download_and_prepare().unwrap_err();
    assert!(
        matches!(err.root(), Error::Core(ml_datasets_core::Error::SchemaVersionMismatch { .. })),
        "{err}"
    );
    assert_eq!(strings.state(), BuildState::Failed);
    assert_eq!(shard_mtimes(&built.data_dir), before);

    let reopened = DatasetBuilder::new(Counter { kind: ScalarKind::Int64 }, BuilderOptions::new(cache.path())).unwrap();
    assert_eq!(reopened.state(), BuildState::Ready);
    assert_eq!(reopened.as_dataset(Some("train")).unwrap().row(0).unwrap(), example! { "n" => 0i64 });
}

#[test]
fn force_redownload_replaces_stale_build() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut ints = DatasetBuilder::new(Counter { kind: ScalarKind::Int64 }, BuilderOptions::new(cache.path())).unwrap();
    ints.download_and_prepare().unwrap();

    let options = BuilderOptions::new(cache.path()).with_generate_mode(GenerateMode::ForceRedownload);
    let mut strings = DatasetBuilder::new(Counter { kind: ScalarKind::String }, options).unwrap();
    let report = strings.download_and_prepare().unwrap();

    assert!(!report.reused);
    assert_eq!(
        strings.info().features.get("n"),
        Some(&FeatureSpec::Scalar(ScalarKind::String))
    );
    let train = strings.as_dataset(Some("train")).unwrap();
    assert_eq!(train.num_rows(), 4);
    assert_eq!(train.row(3).unwrap(), example! { "n" => "3" });

    let config_dir = cache.path().join("counter").join("default");
    let entries: Vec<_> = fs::read_dir(&config_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["0.0.0".to_string()]);

    let mut again = DatasetBuilder::new(Counter { kind: ScalarKind::String }, BuilderOptions::new(cache.path())).unwrap();
    assert_eq!(again.state(), BuildState::Ready);
    assert!(again.download_and_prepare().unwrap().reused);
}

#[test]
fn verified_reads_reject_modified_shards() {
    init_tracing();
    let cache = tempdir().unwrap();
    let mut builder = DatasetBuilder::new(TwoSplits { fail_test: false }, BuilderOptions::new(cache.path())).unwrap();
    let report = builder.download_and_prepare().unwrap();

    let shard = &report.splits.get("train").unwrap().shards[0];
    let path = report.data_dir.join(&shard.file_name);
    let mut bytes = fs::read(&path).unwrap();
    // First byte after the leading magic belongs to the first value buffer
    bytes[8] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let mut options = BuilderOptions::new(cache.path());
    options.verify_shards = true;
    let verifying = DatasetBuilder::new(TwoSplits { fail_test: false }, options).unwrap();
    assert!(matches!(
        verifying.as_dataset(Some("train")),
        Err(Error::Core(ml_datasets_core::Error::CorruptShard { .. }))
    ));
    assert!(verifying.as_dataset(Some("test")).is_ok());
}
