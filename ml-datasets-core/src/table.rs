//! Read-only tables over memory-mapped shards
//!
//! A [`Table`] is a list of opened shards plus a logical row view and a column
//! projection. Slicing, projection, renaming, `take` and concatenation only
//! rewrite the view; shard data is never copied.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use static_assertions::assert_impl_all;

use crate::column::ColumnSource;
use crate::error::{Error, Result};
use crate::features::{FeatureSpec, Features, ScalarKind};
use crate::shard::Shard;
use crate::value::{Example, Value};

/// Fixed-width primitive that can be viewed in place from a shard
pub trait NativeType: bytemuck::Pod {
    /// Stored kind matching this type
    const KIND: ScalarKind;
}

macro_rules! native_type {
    ($($t:ty => $kind:ident),* $(,)?) => {
        $(
            impl NativeType for $t {
                const KIND: ScalarKind = ScalarKind::$kind;
            }
        )*
    };
}

native_type!(
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
    f32 => Float32, f64 => Float64,
);

#[derive(Debug, Clone)]
struct ShardEntry {
    shard: Arc<Shard>,
    /// Shard field index for each output field
    fields: Arc<[usize]>,
}

#[derive(Debug, Clone)]
enum RowView {
    /// Disjoint physical row ranges; `starts[i]` is the logical index of
    /// `ranges[i].start`, with one trailing total
    Ranges {
        ranges: Arc<[Range<u64>]>,
        starts: Arc<[u64]>,
    },
    /// Explicit physical row per logical row
    Indices(Arc<[u64]>),
}

impl RowView {
    fn from_ranges(ranges: Vec<Range<u64>>) -> Self {
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges.into_iter().filter(|r| r.start < r.end) {
            match merged.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => merged.push(range),
            }
        }
        let mut starts = Vec::with_capacity(merged.len() + 1);
        let mut total = 0;
        starts.push(0);
        for range in &merged {
            total += range.end - range.start;
            starts.push(total);
        }
        RowView::Ranges {
            ranges: merged.into(),
            starts: starts.into(),
        }
    }

    fn len(&self) -> u64 {
        match self {
            RowView::Ranges { starts, .. } => starts.last().copied().unwrap_or(0),
            RowView::Indices(indices) => indices.len() as u64,
        }
    }

    fn physical(&self, index: u64) -> u64 {
        match self {
            RowView::Ranges { ranges, starts } => {
                let i = starts.partition_point(|s| *s <= index) - 1;
                ranges[i].start + (index - starts[i])
            }
            RowView::Indices(indices) => indices[index as usize],
        }
    }

    fn to_indices(&self) -> Vec<u64> {
        match self {
            RowView::Ranges { ranges, .. } => ranges.iter().flat_map(Clone::clone).collect(),
            RowView::Indices(indices) => indices.to_vec(),
        }
    }

    fn slice(&self, range: Range<u64>) -> Self {
        match self {
            RowView::Ranges { ranges, starts } => {
                let mut out = Vec::new();
                for (r, start) in ranges.iter().zip(starts.iter()) {
                    let end = start + (r.end - r.start);
                    let lo = range.start.max(*start);
                    let hi = range.end.min(end);
                    if lo < hi {
                        out.push(r.start + (lo - start)..r.start + (hi - start));
                    }
                }
                RowView::from_ranges(out)
            }
            RowView::Indices(indices) => {
                RowView::Indices(indices[range.start as usize..range.end as usize].into())
            }
        }
    }

    fn shifted(&self, base: u64) -> Self {
        match self {
            RowView::Ranges { ranges, .. } => {
                RowView::from_ranges(ranges.iter().map(|r| r.start + base..r.end + base).collect())
            }
            RowView::Indices(indices) => RowView::Indices(indices.iter().map(|i| i + base).collect()),
        }
    }
}

/// Read-only, memory-mapped view over the shards of one split
#[derive(Debug, Clone)]
pub struct Table {
    features: Features,
    entries: Vec<ShardEntry>,
    /// Physical row start of each shard, with one trailing total
    shard_starts: Arc<[u64]>,
    view: RowView,
}

assert_impl_all!(Table: Send, Sync);

impl Table {
    /// Map shard files and check each against the expected schema
    pub fn open<P: AsRef<Path>>(features: &Features, paths: &[P]) -> Result<Self> {
        let shards = paths
            .iter()
            .map(|path| Shard::open_expecting(path, features).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Self::from_shards(features.clone(), shards)
    }

    /// Like [`Table::open`], but also recompute every shard's content digest
    /// and fail with `CorruptShard` when it disagrees with the footer
    pub fn open_verified<P: AsRef<Path>>(features: &Features, paths: &[P]) -> Result<Self> {
        let shards = paths
            .iter()
            .map(|path| {
                let shard = Shard::open_expecting(path, features)?;
                shard.verify_digest()?;
                Ok(Arc::new(shard))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_shards(features.clone(), shards)
    }

    /// Build a table from already opened shards
    pub fn from_shards(features: Features, shards: Vec<Arc<Shard>>) -> Result<Self> {
        let identity: Arc<[usize]> = (0..features.len()).collect();
        let mut starts = Vec::with_capacity(shards.len() + 1);
        let mut total = 0u64;
        starts.push(0);

        let mut entries = Vec::with_capacity(shards.len());
        for shard in shards {
            if shard.features() != &features {
                return Err(Error::SchemaVersionMismatch {
                    path: shard.path().to_path_buf(),
                    expected: features.to_string(),
                    found: shard.features().to_string(),
                });
            }
            total += shard.len() as u64;
            starts.push(total);
            entries.push(ShardEntry {
                shard,
                fields: Arc::clone(&identity),
            });
        }

        Ok(Self {
            features,
            entries,
            shard_starts: starts.into(),
            view: RowView::from_ranges(vec![0..total]),
        })
    }

    /// Schema of the visible columns
    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Number of visible rows
    pub fn num_rows(&self) -> usize {
        self.view.len() as usize
    }

    /// Check if no rows are visible
    pub fn is_empty(&self) -> bool {
        self.view.len() == 0
    }

    /// Visible column names
    pub fn column_names(&self) -> Vec<&str> {
        self.features.names()
    }

    /// Paths of the underlying shard files
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.shard.path().to_path_buf()).collect()
    }

    fn check_index(&self, index: usize) -> Result<u64> {
        let len = self.view.len();
        let index = index as u64;
        if index >= len {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        Ok(self.view.physical(index))
    }

    fn locate(&self, physical: u64) -> (&ShardEntry, usize) {
        let shard = self.shard_starts.partition_point(|s| *s <= physical) - 1;
        (&self.entries[shard], (physical - self.shard_starts[shard]) as usize)
    }

    fn decode_field(&self, field: usize, index: usize) -> Result<Value> {
        let physical = self.check_index(index)?;
        let (entry, local) = self.locate(physical);
        entry
            .shard
            .layout()
            .decode_field(entry.shard.as_ref(), entry.fields[field], local)
    }

    /// Decode row `index`
    pub fn row(&self, index: usize) -> Result<Example> {
        let physical = self.check_index(index)?;
        let (entry, local) = self.locate(physical);
        let layout = entry.shard.layout();
        self.features
            .fields()
            .iter()
            .zip(entry.fields.iter())
            .map(|(field, shard_field)| {
                Ok((
                    field.name.clone(),
                    layout.decode_field(entry.shard.as_ref(), *shard_field, local)?,
                ))
            })
            .collect()
    }

    /// Decode a contiguous range of rows
    pub fn batch(&self, range: Range<usize>) -> Result<Vec<Example>> {
        if range.start > range.end || range.end > self.num_rows() {
            return Err(Error::IndexOutOfBounds {
                index: range.end as u64,
                len: self.view.len(),
            });
        }
        range.map(|i| self.row(i)).collect()
    }

    /// Iterate over decoded rows
    pub fn iter(&self) -> impl Iterator<Item = Result<Example>> + '_ {
        (0..self.num_rows()).map(move |i| self.row(i))
    }

    /// Iterate over decoded batches of at most `size` rows
    pub fn iter_batches(&self, size: usize) -> impl Iterator<Item = Result<Vec<Example>>> + '_ {
        let size = size.max(1);
        (0..self.num_rows())
            .step_by(size)
            .map(move |start| self.batch(start..(start + size).min(self.num_rows())))
    }

    /// Lazy view of one column
    pub fn column(&self, name: &str) -> Result<ColumnView<'_>> {
        let field = self.features.index_of(name)?;
        Ok(ColumnView { table: self, field })
    }

    /// Project onto the given columns, in the given order
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let positions = names
            .iter()
            .map(|n| self.features.index_of(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let features = self.features.project(names)?;
        let entries = self
            .entries
            .iter()
            .map(|entry| ShardEntry {
                shard: Arc::clone(&entry.shard),
                fields: positions.iter().map(|p| entry.fields[*p]).collect(),
            })
            .collect();
        Ok(Self {
            features,
            entries,
            shard_starts: Arc::clone(&self.shard_starts),
            view: self.view.clone(),
        })
    }

    /// Drop the given columns
    pub fn remove_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let kept = self.features.remove(names)?;
        self.select(kept.names().as_slice())
    }

    /// Rename one column
    pub fn rename_column(&self, old: &str, new: &str) -> Result<Self> {
        Ok(Self {
            features: self.features.rename(old, new)?,
            ..self.clone()
        })
    }

    /// Rows `range` of this table
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.num_rows() {
            return Err(Error::IndexOutOfBounds {
                index: range.end as u64,
                len: self.view.len(),
            });
        }
        Ok(Self {
            view: self.view.slice(range.start as u64..range.end as u64),
            ..self.clone()
        })
    }

    /// Rows at the given indices, in the given order
    pub fn take(&self, indices: &[usize]) -> Result<Self> {
        let physical = indices
            .iter()
            .map(|i| self.check_index(*i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            view: RowView::Indices(physical.into()),
            ..self.clone()
        })
    }

    /// Concatenate tables with identical features
    pub fn concat(tables: &[Table]) -> Result<Self> {
        let first = tables
            .first()
            .ok_or_else(|| Error::InvalidArgument("cannot concatenate zero tables".into()))?;
        if let Some(other) = tables.iter().find(|t| t.features != first.features) {
            return Err(Error::InvalidArgument(format!(
                "cannot concatenate tables with features {} and {}",
                first.features, other.features
            )));
        }

        let mut entries = Vec::new();
        let mut starts = vec![0u64];
        let mut views = Vec::with_capacity(tables.len());
        for table in tables {
            let base = starts.last().copied().unwrap_or(0);
            views.push(table.view.shifted(base));
            entries.extend(table.entries.iter().cloned());
            starts.extend(table.shard_starts.iter().skip(1).map(|s| s + base));
        }

        let view = if views.iter().all(|v| matches!(v, RowView::Ranges { .. })) {
            let mut ranges = Vec::new();
            for view in &views {
                if let RowView::Ranges { ranges: r, .. } = view {
                    ranges.extend(r.iter().cloned());
                }
            }
            RowView::from_ranges(ranges)
        } else {
            RowView::Indices(views.iter().flat_map(RowView::to_indices).collect())
        };

        Ok(Self {
            features: first.features.clone(),
            entries,
            shard_starts: starts.into(),
            view,
        })
    }

    /// One of `num_shards` pieces of this table: a contiguous block, or every
    /// `num_shards`-th row starting at `index`
    pub fn shard(&self, num_shards: usize, index: usize, contiguous: bool) -> Result<Self> {
        if num_shards == 0 || index >= num_shards {
            return Err(Error::InvalidArgument(format!(
                "shard index {index} invalid for {num_shards} shards"
            )));
        }
        let n = self.num_rows();
        if contiguous {
            let div = n / num_shards;
            let rem = n % num_shards;
            let start = div * index + index.min(rem);
            let end = start + div + usize::from(index < rem);
            self.slice(start..end)
        } else {
            let indices: Vec<usize> = (index..n).step_by(num_shards).collect();
            self.take(&indices)
        }
    }

    /// Feed the content identity of this table into a hasher: the visible
    /// schema, each shard's content digest and column mapping, and the row view
    pub fn fingerprint_material(&self, hasher: &mut blake3::Hasher) -> Result<()> {
        hasher.update(&self.features.serialize()?);
        hasher.update(&(self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            hasher.update(entry.shard.digest());
            hasher.update(&(entry.shard.len() as u64).to_le_bytes());
            hasher.update(&(entry.fields.len() as u64).to_le_bytes());
            for field in entry.fields.iter() {
                hasher.update(&(*field as u64).to_le_bytes());
            }
        }
        match &self.view {
            RowView::Ranges { ranges, .. } => {
                hasher.update(b"ranges");
                hasher.update(&(ranges.len() as u64).to_le_bytes());
                for range in ranges.iter() {
                    hasher.update(&range.start.to_le_bytes());
                    hasher.update(&range.end.to_le_bytes());
                }
            }
            RowView::Indices(indices) => {
                hasher.update(b"indices");
                hasher.update(&(indices.len() as u64).to_le_bytes());
                hasher.update(bytemuck::cast_slice(indices));
            }
        }
        Ok(())
    }
}

/// Lazy view of one column of a [`Table`]
#[derive(Debug, Clone, Copy)]
pub struct ColumnView<'a> {
    table: &'a Table,
    field: usize,
}

impl<'a> ColumnView<'a> {
    /// Column name
    pub fn name(&self) -> &'a str {
        &self.table.features.fields()[self.field].name
    }

    /// Feature spec of the column
    pub fn spec(&self) -> &'a FeatureSpec {
        &self.table.features.fields()[self.field].spec
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.table.num_rows()
    }

    /// Check if the column has no values
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Value at `index`, decoding only this column
    pub fn get(&self, index: usize) -> Result<Value> {
        self.table.decode_field(self.field, index)
    }

    /// Iterate over the values
    pub fn iter(&self) -> impl Iterator<Item = Result<Value>> + 'a {
        let view = *self;
        (0..view.len()).map(move |i| view.get(i))
    }

    /// Decode all values
    pub fn to_values(&self) -> Result<Vec<Value>> {
        self.iter().collect()
    }

    /// Zero-copy typed slices of a top-level fixed-width column without nulls,
    /// one per contiguous run of rows within a shard
    pub fn primitive_slices<T: NativeType>(&self) -> Result<Vec<&'a [T]>> {
        let RowView::Ranges { ranges, .. } = &self.table.view else {
            return Err(Error::InvalidArgument(
                "primitive slices require a contiguous row view".into(),
            ));
        };

        let table: &'a Table = self.table;
        let mut slices = Vec::new();
        for range in ranges.iter() {
            let mut position = range.start;
            while position < range.end {
                let shard_index = table.shard_starts.partition_point(|s| *s <= position) - 1;
                let entry = &table.entries[shard_index];
                let shard_start = table.shard_starts[shard_index];
                let shard_end = table.shard_starts[shard_index + 1].min(range.end);

                let shard: &'a Shard = entry.shard.as_ref();
                let field_layout = &shard.layout().fields()[entry.fields[self.field]];
                let leaf = field_layout
                    .scalar_leaf()
                    .and_then(|id| shard.leaf(id))
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("column {} is not a scalar column", self.name()))
                    })?;
                if leaf.kind() != T::KIND || leaf.has_nulls() {
                    return Err(Error::InvalidArgument(format!(
                        "column {} of kind {} cannot be viewed as {} without nulls",
                        self.name(),
                        leaf.kind(),
                        T::KIND
                    )));
                }

                let values: &'a [T] = bytemuck::try_cast_slice(leaf.data())
                    .map_err(|err| Error::corrupt(shard.path(), format!("misaligned column: {err}")))?;
                let lo = (position - shard_start) as usize;
                let hi = (shard_end - shard_start) as usize;
                let slice = values
                    .get(lo..hi)
                    .ok_or_else(|| Error::corrupt(shard.path(), "column shorter than row count"))?;
                slices.push(slice);
                position = shard_end;
            }
        }
        Ok(slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example;
    use crate::writer::{ShardWriter, WriterOptions};
    use tempfile::{tempdir, TempDir};

    fn features() -> Features {
        Features::from_pairs([
            ("id", FeatureSpec::Scalar(ScalarKind::Int64)),
            ("text", FeatureSpec::Scalar(ScalarKind::String)),
        ])
        .unwrap()
    }

    fn build(rows: usize, batch_size: usize) -> (TempDir, Table) {
        let dir = tempdir().unwrap();
        let mut writer =
            ShardWriter::new(dir.path(), "t", features(), WriterOptions { batch_size }).unwrap();
        writer
            .write_all((0..rows).map(|i| example! { "id" => i as i64, "text" => format!("row {i}") }))
            .unwrap();
        let summary = writer.finish().unwrap();
        let table = Table::open(&features(), &summary.paths()).unwrap();
        (dir, table)
    }

    fn ids(table: &Table) -> Vec<i64> {
        table
            .column("id")
            .unwrap()
            .iter()
            .map(|v| v.unwrap().as_int().unwrap())
            .collect()
    }

    #[test]
    fn rows_across_shards() {
        let (_dir, table) = build(10, 3);
        assert_eq!(table.num_rows(), 10);
        assert_eq!(table.shard_paths().len(), 4);
        assert_eq!(table.row(7).unwrap(), example! { "id" => 7i64, "text" => "row 7" });
        assert!(matches!(table.row(10), Err(Error::IndexOutOfBounds { index: 10, len: 10 })));
        assert_eq!(table.batch(2..5).unwrap().len(), 3);
        let sizes: Vec<_> = table.iter_batches(4).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn views_compose() {
        let (_dir, table) = build(10, 3);
        let sliced = table.slice(2..8).unwrap();
        assert_eq!(ids(&sliced), vec![2, 3, 4, 5, 6, 7]);

        let taken = sliced.take(&[5, 0, 2]).unwrap();
        assert_eq!(ids(&taken), vec![7, 2, 4]);
        assert_eq!(ids(&taken.slice(1..3).unwrap()), vec![2, 4]);
    }

    #[test]
    fn projection_and_rename_are_lazy() {
        let (_dir, table) = build(4, 10);
        let projected = table.select(&["text"]).unwrap();
        assert_eq!(projected.row(1).unwrap(), example! { "text" => "row 1" });

        let renamed = table.rename_column("text", "content").unwrap();
        assert_eq!(renamed.column_names(), vec!["id", "content"]);
        assert_eq!(renamed.row(0).unwrap()["content"], Value::from("row 0"));

        let removed = table.remove_columns(&["id"]).unwrap();
        assert_eq!(removed.features(), projected.features());
        assert!(matches!(table.select(&["missing"]), Err(Error::ColumnNotFound(_))));
    }

    #[test]
    fn concatenation_keeps_order() {
        let (_a, first) = build(3, 2);
        let (_b, second) = build(2, 2);
        let joined = Table::concat(&[first.slice(1..3).unwrap(), second.clone()]).unwrap();
        assert_eq!(ids(&joined), vec![1, 2, 0, 1]);

        let mixed = Table::concat(&[second.take(&[1, 0]).unwrap(), first]).unwrap();
        assert_eq!(ids(&mixed), vec![1, 0, 0, 1, 2]);

        let other = second.select(&["id"]).unwrap();
        assert!(Table::concat(&[other, second]).is_err());
    }

    #[test]
    fn sharding_covers_all_rows() {
        let (_dir, table) = build(10, 4);
        let contiguous: Vec<_> = (0..3).map(|i| ids(&table.shard(3, i, true).unwrap())).collect();
        assert_eq!(contiguous, vec![vec![0, 1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]);
        assert_eq!(ids(&table.shard(3, 1, false).unwrap()), vec![1, 4, 7]);
        assert!(table.shard(3, 3, true).is_err());
    }

    #[test]
    fn primitive_slices_are_zero_copy() {
        let (_dir, table) = build(7, 3);
        let column = table.slice(1..6).unwrap();
        let column = column.column("id").unwrap();
        let slices = column.primitive_slices::<i64>().unwrap();
        let flat: Vec<i64> = slices.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(flat, vec![1, 2, 3, 4, 5]);
        assert_eq!(slices.len(), 2);
        assert!(column.primitive_slices::<i32>().is_err());
    }

    #[test]
    fn fingerprint_material_reflects_view() {
        let (_dir, table) = build(5, 5);
        let digest = |t: &Table| {
            let mut hasher = blake3::Hasher::new();
            t.fingerprint_material(&mut hasher).unwrap();
            hasher.finalize()
        };
        assert_eq!(digest(&table), digest(&table.clone()));
        assert_ne!(digest(&table), digest(&table.slice(0..4).unwrap()));
        assert_ne!(digest(&table), digest(&table.select(&["id"]).unwrap()));
    }

    #[test]
    fn verified_open_detects_modified_content() {
        let (_dir, table) = build(4, 2);
        let paths = table.shard_paths();
        assert_eq!(Table::open_verified(&features(), &paths).unwrap().num_rows(), 4);

        let mut bytes = std::fs::read(&paths[1]).unwrap();
        let position = bytes.windows(5).position(|w| w == b"row 3").unwrap();
        bytes[position + 4] = b'9';
        std::fs::write(&paths[1], &bytes).unwrap();

        assert_eq!(Table::open(&features(), &paths).unwrap().row(3).unwrap()["text"], Value::from("row 9"));
        assert!(matches!(
            Table::open_verified(&features(), &paths),
            Err(Error::CorruptShard { .. })
        ));
    }

    #[test]
    fn open_rejects_other_schema() {
        let (_dir, table) = build(2, 2);
        let other = Features::from_pairs([("id", FeatureSpec::Scalar(ScalarKind::Int32))]).unwrap();
        assert!(matches!(
            Table::open(&other, &table.shard_paths()),
            Err(Error::SchemaVersionMismatch { .. })
        ));
    }
}
