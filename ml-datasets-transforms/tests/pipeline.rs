use std::path::Path;
use std::sync::Arc;

use ml_datasets_core::{
    example, Example, FeatureSpec, Features, ScalarKind, ShardWriter, Table, Value, WriterOptions,
};
use ml_datasets_transforms::{
    Error, FingerprintCache, FunctionId, MapOptions, Pipeline, SplitSize, TrainTestSplitOptions,
};
use tempfile::{tempdir, TempDir};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn features() -> Features {
    Features::from_pairs([
        ("id", FeatureSpec::Scalar(ScalarKind::Int64)),
        ("text", FeatureSpec::Scalar(ScalarKind::String)),
    ])
    .unwrap()
}

/// Source table of `rows` rows spread over shards of 7 rows
fn source(dir: &Path, rows: i64) -> Table {
    let mut writer = ShardWriter::new(dir, "source", features(), WriterOptions { batch_size: 7 }).unwrap();
    writer
        .write_all((0..rows).map(|i| example! { "id" => i, "text" => format!("row {i}") }))
        .unwrap();
    let summary = writer.finish().unwrap();
    Table::open(&features(), &summary.paths()).unwrap()
}

fn setup(rows: i64) -> (TempDir, Table, Pipeline) {
    init_tracing();
    let dir = tempdir().unwrap();
    let table = source(&dir.path().join("source"), rows);
    let cache = FingerprintCache::new(dir.path().join("cache")).unwrap();
    (dir, table, Pipeline::new(Arc::new(cache)))
}

fn ids(table: &Table) -> Vec<i64> {
    table
        .column("id")
        .unwrap()
        .iter()
        .map(|v| v.unwrap().as_int().unwrap())
        .collect()
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

fn add_length(row: &Example, _: usize) -> anyhow::Result<Example> {
    let text = row["text"].as_str().unwrap_or_default();
    Ok(example! { "length" => text.len() as i64 })
}

#[test]
fn repeated_map_is_served_from_cache() {
    let (dir, table, pipeline) = setup(20);
    let function = FunctionId::new("add_length", 1);
    let options = MapOptions::default();

    let first = pipeline.map(&table, &function, &options, add_length).unwrap();
    let files_after_first = count_files(&dir.path().join("cache"));

    let second = pipeline
        .map(&table, &function, &options, |_, _| anyhow::bail!("must not run on a hit"))
        .unwrap();

    assert_eq!(count_files(&dir.path().join("cache")), files_after_first);
    assert_eq!(pipeline.cache().stats().hits, 1);
    assert_eq!(pipeline.cache().stats().misses, 1);
    assert_eq!(first.num_rows(), 20);
    assert_eq!(second.row(11).unwrap(), first.row(11).unwrap());
    assert_eq!(first.column_names(), vec!["id", "text", "length"]);
    assert_eq!(first.row(11).unwrap()["length"], Value::Int(6));
}

#[test]
fn new_function_version_recomputes() {
    let (_dir, table, pipeline) = setup(5);
    let options = MapOptions::default();

    pipeline
        .map(&table, &FunctionId::new("add_length", 1), &options, add_length)
        .unwrap();
    pipeline
        .map(&table, &FunctionId::new("add_length", 2), &options, add_length)
        .unwrap();

    assert_eq!(pipeline.cache().stats().misses, 2);
    assert_eq!(pipeline.cache().stats().stores, 2);
}

#[test]
fn map_removes_columns_before_merging() {
    let (_dir, table, pipeline) = setup(4);
    let options = MapOptions {
        remove_columns: vec!["text".into()],
        ..MapOptions::default()
    };

    let mapped = pipeline
        .map(&table, &FunctionId::new("shout", 1), &options, |row, _| {
            let text = row["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(example! { "loud" => text })
        })
        .unwrap();

    assert_eq!(mapped.column_names(), vec!["id", "loud"]);
    assert_eq!(mapped.features().get("loud"), Some(&FeatureSpec::Scalar(ScalarKind::String)));
    assert_eq!(mapped.row(2).unwrap()["loud"], Value::from("ROW 2"));
}

#[test]
fn failing_function_leaves_no_cache_entry() {
    let (dir, table, pipeline) = setup(10);

    let err = pipeline
        .map(&table, &FunctionId::new("broken", 1), &MapOptions::default(), |_, i| {
            anyhow::ensure!(i < 5, "row {i} rejected");
            Ok(Example::new())
        })
        .unwrap_err();

    assert!(matches!(err, Error::Transformation { operation: "map", .. }));
    assert_eq!(count_files(&dir.path().join("cache")), 0);
}

#[test]
fn map_batched_may_change_row_count() {
    let (_dir, table, pipeline) = setup(10);
    let options = MapOptions {
        batch_size: 4,
        ..MapOptions::default()
    };

    let doubled = pipeline
        .map_batched(&table, &FunctionId::new("duplicate", 1), &options, |batch, _| {
            Ok(batch.into_iter().flat_map(|row| [row.clone(), row]).collect())
        })
        .unwrap();

    assert_eq!(doubled.num_rows(), 20);
    assert_eq!(ids(&doubled)[..6], [0, 0, 1, 1, 2, 2]);
}

#[test]
fn filter_preserves_order() {
    let (_dir, table, pipeline) = setup(30);

    let even = pipeline
        .filter(&table, &FunctionId::new("even", 1), |row, _| {
            Ok(row["id"].as_int().unwrap_or(1) % 2 == 0)
        })
        .unwrap();

    assert_eq!(ids(&even), (0..30).step_by(2).collect::<Vec<_>>());

    let none = pipeline
        .filter(&table, &FunctionId::new("none", 1), |_, _| Ok(false))
        .unwrap();
    assert!(none.is_empty());
    assert_eq!(none.features(), table.features());
}

#[test]
fn sorts_are_stable() {
    let (_dir, table, pipeline) = setup(12);

    let descending = pipeline.sort_by_column(&table, "id", true).unwrap();
    assert_eq!(ids(&descending), (0..12).rev().collect::<Vec<_>>());

    let by_parity = pipeline
        .sort(&table, &FunctionId::new("parity", 1), |row| {
            Ok(Value::Int(row["id"].as_int().unwrap_or(0) % 2))
        })
        .unwrap();
    assert_eq!(ids(&by_parity), vec![0, 2, 4, 6, 8, 10, 1, 3, 5, 7, 9, 11]);
}

#[test]
fn shuffle_is_reproducible() {
    let (_dir, table, pipeline) = setup(25);

    let a = pipeline.shuffle(&table, 7).unwrap();
    let b = pipeline.shuffle(&table, 7).unwrap();
    let c = pipeline.shuffle(&table, 8).unwrap();

    assert_eq!(ids(&a), ids(&b));
    assert_ne!(ids(&a), ids(&c));
    assert_eq!(pipeline.cache().stats().hits, 1);

    let mut sorted = ids(&a);
    sorted.sort_unstable();
    assert_eq!(sorted, (0..25).collect::<Vec<_>>());
}

#[test]
fn unshuffled_split_is_disjoint_and_ordered() {
    let (_dir, table, pipeline) = setup(50);
    let options = TrainTestSplitOptions {
        test_size: Some(SplitSize::Fraction(0.3)),
        shuffle: false,
        ..TrainTestSplitOptions::default()
    };

    let split = pipeline.train_test_split(&table, &options).unwrap();
    let (train, test) = (ids(&split.train), ids(&split.test));

    assert_eq!(test.len(), 15);
    assert_eq!(train.len(), 35);
    assert!(train.windows(2).all(|w| w[0] < w[1]));
    assert!(test.windows(2).all(|w| w[0] < w[1]));
    assert!(train.iter().all(|id| !test.contains(id)));
}

#[test]
fn seeded_split_is_reproducible() {
    let (_dir, table, pipeline) = setup(40);
    let options = TrainTestSplitOptions {
        test_size: Some(SplitSize::Absolute(10)),
        seed: Some(3),
        ..TrainTestSplitOptions::default()
    };

    let first = pipeline.train_test_split(&table, &options).unwrap();
    let second = pipeline.train_test_split(&table, &options).unwrap();

    assert_eq!(ids(&first.test), ids(&second.test));
    assert_eq!(ids(&first.train), ids(&second.train));

    let mut all = ids(&first.train);
    all.extend(ids(&first.test));
    all.sort_unstable();
    assert_eq!(all, (0..40).collect::<Vec<_>>());
}

#[test]
fn views_compose_with_materialization() {
    let (_dir, table, pipeline) = setup(20);

    let tail = pipeline.slice(&table, 15..20).unwrap();
    let head = pipeline.slice(&table, 0..2).unwrap();
    let joined = pipeline.concatenate(&[tail, head]).unwrap();
    let flat = pipeline.flatten_indices(&joined).unwrap();

    assert_eq!(ids(&flat), vec![15, 16, 17, 18, 19, 0, 1]);
    assert_eq!(ids(&pipeline.shard(&table, 4, 1, true).unwrap()), vec![5, 6, 7, 8, 9]);

    let renamed = pipeline.rename_column(&flat, "text", "body").unwrap();
    let only_body = pipeline.select(&renamed, &["body"]).unwrap();
    assert_eq!(only_body.row(0).unwrap(), example! { "body" => "row 15" });
    assert_eq!(pipeline.remove_columns(&renamed, &["body"]).unwrap().column_names(), vec!["id"]);
}

#[test]
fn unique_keeps_first_seen_order() {
    let (_dir, table, pipeline) = setup(9);

    let buckets = pipeline
        .map(&table, &FunctionId::new("bucket", 1), &MapOptions::default(), |row, _| {
            Ok(example! { "bucket" => row["id"].as_int().unwrap_or(0) % 3 })
        })
        .unwrap();
    let reversed = pipeline.sort_by_column(&buckets, "id", true).unwrap();

    assert_eq!(
        pipeline.unique(&reversed, "bucket").unwrap(),
        vec![Value::Int(2), Value::Int(1), Value::Int(0)]
    );
}
