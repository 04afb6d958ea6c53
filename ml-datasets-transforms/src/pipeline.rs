//! Cache-aware transformations over tables
//!
//! Operations that produce new row content (`map`, `filter`, `sort`,
//! `shuffle`, `flatten_indices`) are materialized into shard files through the
//! [`FingerprintCache`]: each computes its fingerprint first and returns the
//! cached table when one exists. Operations that only rewrite the row view or
//! projection (`select`, `slice`, `concatenate`, `shard`, `train_test_split`)
//! are O(1) and never touch the cache.

use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ml_datasets_core::{
    Example, FeatureSpec, Features, Field, ShardWriter, Table, Value, WriterOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::cache::{FingerprintCache, Materialized};
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintBuilder, FunctionId};

/// Pipeline-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Writer settings for materialized results
    pub writer: WriterOptions,
}

/// Settings of a `map` call
#[derive(Debug, Clone, PartialEq)]
pub struct MapOptions {
    /// Rows per call of a batched function
    pub batch_size: usize,

    /// Output schema; inferred from the first output row when absent
    pub output_features: Option<Features>,

    /// Input columns dropped from the output
    pub remove_columns: Vec<String>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            output_features: None,
            remove_columns: Vec::new(),
        }
    }
}

/// Size of one side of a train/test split
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SplitSize {
    /// Number of rows
    Absolute(usize),

    /// Fraction of the rows, strictly between 0 and 1
    Fraction(f64),
}

/// Settings of [`Pipeline::train_test_split`]
#[derive(Debug, Clone, PartialEq)]
pub struct TrainTestSplitOptions {
    /// Size of the test side; defaults to the complement of `train_size`, or
    /// 25% when both are absent
    pub test_size: Option<SplitSize>,

    /// Size of the train side; defaults to the complement of `test_size`
    pub train_size: Option<SplitSize>,

    /// Draw both sides from a seeded permutation instead of contiguous blocks
    pub shuffle: bool,

    /// Permutation seed; a random seed is drawn when absent
    pub seed: Option<u64>,
}

impl Default for TrainTestSplitOptions {
    fn default() -> Self {
        Self {
            test_size: None,
            train_size: None,
            shuffle: true,
            seed: None,
        }
    }
}

/// The two sides of a train/test split
#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    /// Train rows
    pub train: Table,

    /// Test rows
    pub test: Table,
}

/// Deterministic Fisher–Yates permutation of `0..len` keyed by `seed`
pub fn permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..len).collect();
    for i in (1..len).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    order
}

fn stable_order(keys: &[Value], reverse: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|a, b| {
        let ordering = keys[*a].total_cmp(&keys[*b]);
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    order
}

/// Keep the input spec of columns whose values still conform, infer the rest
fn infer_features(input: &Features, example: &Example) -> Result<Features> {
    let mut fields = Vec::with_capacity(example.len());
    for field in input.fields() {
        if let Some(value) = example.get(&field.name) {
            let spec = if field.spec.validate(value, &field.name).is_ok() {
                field.spec.clone()
            } else {
                FeatureSpec::infer(value, &field.name)?
            };
            fields.push(Field::new(&field.name, spec));
        }
    }
    for (name, value) in example {
        if input.get(name).is_none() {
            fields.push(Field::new(name, FeatureSpec::infer(value, name)?));
        }
    }
    Ok(Features::new(fields)?)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn resolve_split_sizes(
    n: usize,
    test: Option<SplitSize>,
    train: Option<SplitSize>,
) -> Result<(usize, usize)> {
    let check = |size: SplitSize, side: &str| match size {
        SplitSize::Fraction(f) if f > 0.0 && f < 1.0 => Ok(()),
        SplitSize::Absolute(k) if k > 0 && k < n => Ok(()),
        other => Err(Error::InvalidArgument(format!(
            "{side} size {other:?} invalid for {n} rows"
        ))),
    };
    if let Some(size) = test {
        check(size, "test")?;
    }
    if let Some(size) = train {
        check(size, "train")?;
    }

    let test_rows = test.map(|size| match size {
        SplitSize::Fraction(f) => (f * n as f64).ceil() as usize,
        SplitSize::Absolute(k) => k,
    });
    let train_rows = train.map(|size| match size {
        SplitSize::Fraction(f) => (f * n as f64).floor() as usize,
        SplitSize::Absolute(k) => k,
    });

    let (train_rows, test_rows) = match (train_rows, test_rows) {
        (Some(train), Some(test)) => (train, test),
        (Some(train), None) => (train, n.saturating_sub(train)),
        (None, Some(test)) => (n.saturating_sub(test), test),
        (None, None) => {
            let test = (0.25 * n as f64).ceil() as usize;
            (n - test, test)
        }
    };

    if train_rows + test_rows > n {
        return Err(Error::InvalidArgument(format!(
            "train size {train_rows} plus test size {test_rows} exceeds {n} rows"
        )));
    }
    if train_rows == 0 || test_rows == 0 {
        return Err(Error::InvalidArgument(format!(
            "split of {n} rows into {train_rows}/{test_rows} leaves one side empty"
        )));
    }
    Ok((train_rows, test_rows))
}

/// Applies transformations to tables, caching materialized results
#[derive(Debug, Clone)]
pub struct Pipeline {
    cache: Arc<FingerprintCache>,
    options: PipelineOptions,
}

impl Pipeline {
    /// Create a pipeline over a cache
    pub fn new(cache: Arc<FingerprintCache>) -> Self {
        Self::with_options(cache, PipelineOptions::default())
    }

    /// Create a pipeline with explicit options
    pub fn with_options(cache: Arc<FingerprintCache>, options: PipelineOptions) -> Self {
        Self { cache, options }
    }

    /// The backing cache
    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    fn materialize<I>(&self, dir: &Path, features: Features, rows: I) -> Result<Materialized>
    where
        I: IntoIterator<Item = Result<Example>>,
    {
        let mut writer = ShardWriter::new(dir, "data", features.clone(), self.options.writer.clone())?;
        for row in rows {
            writer.write(&row?)?;
        }
        let summary = writer.finish()?;
        Ok(Materialized {
            features,
            shards: summary.shards,
        })
    }

    fn materialize_inferred<I>(
        &self,
        dir: &Path,
        input: &Features,
        options: &MapOptions,
        rows: I,
    ) -> Result<Materialized>
    where
        I: IntoIterator<Item = Result<Example>>,
    {
        let mut rows = rows.into_iter();
        let first = rows.next().transpose()?;
        let features = match (&options.output_features, &first) {
            (Some(features), _) => features.clone(),
            (None, Some(example)) => infer_features(input, example)?,
            (None, None) => input.remove(options.remove_columns.as_slice())?,
        };
        self.materialize(dir, features, first.map(Ok).into_iter().chain(rows))
    }

    fn write_order(&self, dir: &Path, table: &Table, order: &[usize]) -> Result<Materialized> {
        self.materialize(
            dir,
            table.features().clone(),
            order.iter().map(|i| -> Result<Example> { Ok(table.row(*i)?) }),
        )
    }

    /// Apply `f` to every row. The returned example updates the input row:
    /// its fields are added or overwrite existing ones, after the columns in
    /// `options.remove_columns` have been dropped.
    pub fn map<F>(&self, table: &Table, function: &FunctionId, options: &MapOptions, f: F) -> Result<Table>
    where
        F: Fn(&Example, usize) -> anyhow::Result<Example>,
    {
        table.features().remove(options.remove_columns.as_slice())?;
        let fingerprint = FingerprintBuilder::new("map")
            .table(table)?
            .function(function)
            .arg("output_features", &options.output_features)?
            .arg("remove_columns", &options.remove_columns)?
            .finish();

        self.cache.get_or_compute(fingerprint, "map", |dir| {
            let rows = (0..table.num_rows()).map(|i| -> Result<Example> {
                let mut row = table.row(i)?;
                let update = f(&row, i).map_err(|err| Error::transformation("map", err))?;
                for column in &options.remove_columns {
                    row.remove(column);
                }
                row.extend(update);
                Ok(row)
            });
            self.materialize_inferred(dir, table.features(), options, rows)
        })
    }

    /// Apply `f` to consecutive batches of `options.batch_size` rows. The
    /// returned examples replace the batch and may differ in number.
    pub fn map_batched<F>(
        &self,
        table: &Table,
        function: &FunctionId,
        options: &MapOptions,
        f: F,
    ) -> Result<Table>
    where
        F: Fn(Vec<Example>, Range<usize>) -> anyhow::Result<Vec<Example>>,
    {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".into()));
        }
        let fingerprint = FingerprintBuilder::new("map_batched")
            .table(table)?
            .function(function)
            .arg("batch_size", &(options.batch_size as u64))?
            .arg("output_features", &options.output_features)?
            .arg("remove_columns", &options.remove_columns)?
            .finish();

        self.cache.get_or_compute(fingerprint, "map_batched", |dir| {
            let n = table.num_rows();
            let rows = (0..n).step_by(options.batch_size).flat_map(|start| {
                let range = start..(start + options.batch_size).min(n);
                let output = table
                    .batch(range.clone())
                    .map_err(Error::from)
                    .and_then(|batch| {
                        f(batch, range).map_err(|err| Error::transformation("map_batched", err))
                    });
                match output {
                    Ok(examples) => examples
                        .into_iter()
                        .map(|mut example| {
                            for column in &options.remove_columns {
                                example.remove(column);
                            }
                            Ok::<_, Error>(example)
                        })
                        .collect::<Vec<_>>(),
                    Err(err) => vec![Err(err)],
                }
            });
            self.materialize_inferred(dir, table.features(), options, rows)
        })
    }

    /// Keep rows for which `predicate` holds, preserving their order.
    ///
    /// The predicate is first evaluated over every row into a mask; a second
    /// pass then writes only the kept rows.
    pub fn filter<F>(&self, table: &Table, function: &FunctionId, predicate: F) -> Result<Table>
    where
        F: Fn(&Example, usize) -> anyhow::Result<bool>,
    {
        let fingerprint = FingerprintBuilder::new("filter")
            .table(table)?
            .function(function)
            .finish();

        self.cache.get_or_compute(fingerprint, "filter", |dir| {
            let mask = (0..table.num_rows())
                .map(|i| -> Result<bool> {
                    let row = table.row(i)?;
                    predicate(&row, i).map_err(|err| Error::transformation("filter", err))
                })
                .collect::<Result<Vec<bool>>>()?;

            let kept: Vec<usize> = mask
                .iter()
                .enumerate()
                .filter_map(|(i, keep)| keep.then_some(i))
                .collect();
            tracing::debug!(rows = table.num_rows(), kept = kept.len(), "filter mask computed");
            self.write_order(dir, table, &kept)
        })
    }

    /// Stable sort by the values of one column
    pub fn sort_by_column(&self, table: &Table, column: &str, reverse: bool) -> Result<Table> {
        let values = table.column(column)?;
        let fingerprint = FingerprintBuilder::new("sort_by_column")
            .table(table)?
            .arg("column", column)?
            .arg("reverse", &reverse)?
            .finish();

        self.cache.get_or_compute(fingerprint, "sort_by_column", |dir| {
            let keys = values.to_values()?;
            self.write_order(dir, table, &stable_order(&keys, reverse))
        })
    }

    /// Stable sort by a derived key; ties keep their original order
    pub fn sort<K>(&self, table: &Table, function: &FunctionId, key: K) -> Result<Table>
    where
        K: Fn(&Example) -> anyhow::Result<Value>,
    {
        let fingerprint = FingerprintBuilder::new("sort")
            .table(table)?
            .function(function)
            .finish();

        self.cache.get_or_compute(fingerprint, "sort", |dir| {
            let keys = table
                .iter()
                .map(|row| -> Result<Value> {
                    key(&row?).map_err(|err| Error::transformation("sort", err))
                })
                .collect::<Result<Vec<_>>>()?;
            self.write_order(dir, table, &stable_order(&keys, false))
        })
    }

    /// Reorder rows by a permutation derived from `seed` and the row count
    pub fn shuffle(&self, table: &Table, seed: u64) -> Result<Table> {
        let fingerprint = FingerprintBuilder::new("shuffle")
            .table(table)?
            .arg("seed", &seed)?
            .finish();

        self.cache.get_or_compute(fingerprint, "shuffle", |dir| {
            self.write_order(dir, table, &permutation(table.num_rows(), seed))
        })
    }

    /// Materialize a view (slice, take, concatenation) into fresh shards
    pub fn flatten_indices(&self, table: &Table) -> Result<Table> {
        let fingerprint = FingerprintBuilder::new("flatten_indices").table(table)?.finish();
        self.cache.get_or_compute(fingerprint, "flatten_indices", |dir| {
            let order: Vec<usize> = (0..table.num_rows()).collect();
            self.write_order(dir, table, &order)
        })
    }

    /// Project onto the given columns
    pub fn select<S: AsRef<str>>(&self, table: &Table, columns: &[S]) -> Result<Table> {
        Ok(table.select(columns)?)
    }

    /// Rename one column
    pub fn rename_column(&self, table: &Table, old: &str, new: &str) -> Result<Table> {
        Ok(table.rename_column(old, new)?)
    }

    /// Drop the given columns
    pub fn remove_columns<S: AsRef<str>>(&self, table: &Table, columns: &[S]) -> Result<Table> {
        Ok(table.remove_columns(columns)?)
    }

    /// Rows `range` of a table
    pub fn slice(&self, table: &Table, range: Range<usize>) -> Result<Table> {
        Ok(table.slice(range)?)
    }

    /// Concatenate tables with identical features
    pub fn concatenate(&self, tables: &[Table]) -> Result<Table> {
        Ok(Table::concat(tables)?)
    }

    /// One of `num_shards` pieces of a table
    pub fn shard(&self, table: &Table, num_shards: usize, index: usize, contiguous: bool) -> Result<Table> {
        Ok(table.shard(num_shards, index, contiguous)?)
    }

    /// Split a table into train and test views.
    ///
    /// Fractional test sizes round up and fractional train sizes round down.
    /// Without shuffling, train is the leading block and test follows it.
    pub fn train_test_split(&self, table: &Table, options: &TrainTestSplitOptions) -> Result<TrainTestSplit> {
        let n = table.num_rows();
        let (train_rows, test_rows) = resolve_split_sizes(n, options.test_size, options.train_size)?;

        if options.shuffle {
            let seed = options.seed.unwrap_or_else(rand::random);
            let order = permutation(n, seed);
            Ok(TrainTestSplit {
                test: table.take(&order[..test_rows])?,
                train: table.take(&order[test_rows..test_rows + train_rows])?,
            })
        } else {
            Ok(TrainTestSplit {
                train: table.slice(0..train_rows)?,
                test: table.slice(train_rows..train_rows + test_rows)?,
            })
        }
    }

    /// Distinct values of a column in first-seen order
    pub fn unique(&self, table: &Table, column: &str) -> Result<Vec<Value>> {
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for value in table.column(column)?.iter() {
            let value = value?;
            let mut hasher = blake3::Hasher::new();
            value.hash_into(&mut hasher);
            if seen.insert(*hasher.finalize().as_bytes()) {
                values.push(value);
            }
        }
        Ok(values)
    }
}
