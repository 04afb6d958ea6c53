//! Columnar writer: batches examples into shard files

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::column::ColumnBatch;
use crate::error::{Error, Result};
use crate::features::Features;
use crate::layout::PhysicalLayout;
use crate::shard::{shard_file_name, shard_paths, write_shard, ShardFileInfo};
use crate::value::Example;

/// Options for [`ShardWriter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// Number of rows accumulated in memory before a shard is flushed
    pub batch_size: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { batch_size: 10_000 }
    }
}

/// Result of a completed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    /// Directory holding the shards
    pub dir: PathBuf,

    /// Total number of rows written
    pub num_rows: u64,

    /// Total size of the shard files in bytes
    pub num_bytes: u64,

    /// Shards in write order
    pub shards: Vec<ShardFileInfo>,
}

impl WriteSummary {
    /// Full paths of the written shards
    pub fn paths(&self) -> Vec<PathBuf> {
        shard_paths(&self.dir, &self.shards)
    }
}

/// Writes a stream of examples into one or more shard files.
///
/// Rows accumulate in an in-memory [`ColumnBatch`] until `batch_size` is
/// reached; each full batch is published atomically as
/// `<prefix>-<NNNNN>.shard`. If any example fails to encode, every shard this
/// writer already published is removed before the error is returned. A writer
/// dropped without [`finish`](Self::finish) discards its shards the same way.
#[derive(Debug)]
pub struct ShardWriter {
    dir: PathBuf,
    prefix: String,
    layout: Arc<PhysicalLayout>,
    options: WriterOptions,
    current: ColumnBatch,
    shards: Vec<ShardFileInfo>,
    rows_seen: u64,
    state: WriterState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Aborted,
    Finished,
}

impl ShardWriter {
    /// Create a writer; the directory is created if missing
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        features: Features,
        options: WriterOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".into()));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let layout = Arc::new(PhysicalLayout::new(features));
        Ok(Self {
            current: ColumnBatch::new(Arc::clone(&layout)),
            dir,
            prefix: prefix.to_string(),
            layout,
            options,
            shards: Vec::new(),
            rows_seen: 0,
            state: WriterState::Open,
        })
    }

    /// Schema of the written shards
    pub fn features(&self) -> &Features {
        self.layout.features()
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of rows accepted so far
    pub fn rows_written(&self) -> u64 {
        self.rows_seen
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Aborted => Err(Error::InvalidArgument("writer was aborted".into())),
            WriterState::Finished => Err(Error::InvalidArgument("writer already finished".into())),
        }
    }

    /// Append one example
    pub fn write(&mut self, example: &Example) -> Result<()> {
        self.ensure_open()?;
        let row = self.rows_seen;
        if let Err(err) = self.current.push(example) {
            self.discard();
            return Err(Error::EncodingFailure {
                row,
                source: Box::new(err),
            });
        }
        self.rows_seen += 1;

        if self.current.len() >= self.options.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append every example of an iterator
    pub fn write_all<I>(&mut self, examples: I) -> Result<()>
    where
        I: IntoIterator<Item = Example>,
    {
        for example in examples {
            self.write(&example)?;
        }
        Ok(())
    }

    /// Append a pre-encoded batch as its own shard
    pub fn write_encoded(&mut self, batch: &ColumnBatch) -> Result<()> {
        self.ensure_open()?;
        if batch.layout().features() != self.features() {
            return Err(Error::SchemaVersionMismatch {
                path: self.dir.clone(),
                expected: self.features().to_string(),
                found: batch.layout().features().to_string(),
            });
        }
        self.flush()?;
        if !batch.is_empty() {
            self.publish(batch)?;
            self.rows_seen += batch.len() as u64;
        }
        Ok(())
    }

    fn publish(&mut self, batch: &ColumnBatch) -> Result<()> {
        let path = self.dir.join(shard_file_name(&self.prefix, self.shards.len()));
        match write_shard(&path, batch) {
            Ok(info) => {
                self.shards.push(info);
                Ok(())
            }
            Err(err) => {
                self.discard();
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.current, ColumnBatch::new(Arc::clone(&self.layout)));
        self.publish(&batch)
    }

    /// Flush the final partial batch and return the summary. A stream without
    /// rows still produces one empty shard carrying the schema.
    pub fn finish(mut self) -> Result<WriteSummary> {
        self.ensure_open()?;
        self.flush()?;
        if self.shards.is_empty() {
            let empty = ColumnBatch::new(Arc::clone(&self.layout));
            self.publish(&empty)?;
        }
        self.state = WriterState::Finished;

        let shards = std::mem::take(&mut self.shards);
        let summary = WriteSummary {
            dir: self.dir.clone(),
            num_rows: shards.iter().map(|s| s.num_rows).sum(),
            num_bytes: shards.iter().map(|s| s.num_bytes).sum(),
            shards,
        };
        tracing::debug!(
            dir = %summary.dir.display(),
            rows = summary.num_rows,
            shards = summary.shards.len(),
            "finished write"
        );
        Ok(summary)
    }

    /// Remove every shard published by this writer
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.state != WriterState::Open {
            return;
        }
        self.state = WriterState::Aborted;
        for info in self.shards.drain(..) {
            let path = self.dir.join(&info.file_name);
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove discarded shard");
            }
        }
        tracing::debug!(dir = %self.dir.display(), prefix = %self.prefix, "discarded partial write");
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example;
    use crate::features::{FeatureSpec, ScalarKind};
    use crate::shard::Shard;
    use crate::value::Value;
    use tempfile::tempdir;

    fn features() -> Features {
        Features::from_pairs([("content", FeatureSpec::Scalar(ScalarKind::String))]).unwrap()
    }

    fn shard_files(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn flushes_full_batches_and_final_partial() {
        let dir = tempdir().unwrap();
        let mut writer =
            ShardWriter::new(dir.path(), "train", features(), WriterOptions { batch_size: 2 }).unwrap();
        writer
            .write_all((0..5).map(|i| example! { "content" => format!("row {i}") }))
            .unwrap();
        let summary = writer.finish().unwrap();

        assert_eq!(summary.num_rows, 5);
        let names: Vec<_> = summary.shards.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(names, vec!["train-00000.shard", "train-00001.shard", "train-00002.shard"]);
        assert_eq!(summary.num_bytes, summary.shards.iter().map(|s| s.num_bytes).sum::<u64>());

        let last = Shard::open(&summary.paths()[2]).unwrap();
        assert_eq!(last.row(0).unwrap(), example! { "content" => "row 4" });
    }

    #[test]
    fn encoding_failure_discards_everything() {
        let dir = tempdir().unwrap();
        let mut writer =
            ShardWriter::new(dir.path(), "train", features(), WriterOptions { batch_size: 2 }).unwrap();

        let mut rows: Vec<Example> = (0..3).map(|i| example! { "content" => format!("{i}") }).collect();
        rows.push(example! { "content" => 42 });
        let err = writer.write_all(rows).unwrap_err();

        assert!(matches!(err, Error::EncodingFailure { row: 3, .. }));
        assert_eq!(shard_files(dir.path()), 0);
        assert!(writer.write(&example! { "content" => "late" }).is_err());
    }

    #[test]
    fn empty_stream_writes_one_empty_shard() {
        let dir = tempdir().unwrap();
        let writer = ShardWriter::new(dir.path(), "test", features(), WriterOptions::default()).unwrap();
        let summary = writer.finish().unwrap();
        assert_eq!(summary.num_rows, 0);
        assert_eq!(summary.shards.len(), 1);

        let shard = Shard::open(&summary.paths()[0]).unwrap();
        assert!(shard.is_empty());
        assert_eq!(shard.features(), &features());
    }

    #[test]
    fn dropped_writer_removes_flushed_shards() {
        let dir = tempdir().unwrap();
        {
            let mut writer =
                ShardWriter::new(dir.path(), "train", features(), WriterOptions { batch_size: 1 }).unwrap();
            writer.write(&example! { "content" => Value::Null }).unwrap();
            assert_eq!(shard_files(dir.path()), 1);
        }
        assert_eq!(shard_files(dir.path()), 0);
    }

    #[test]
    fn pre_encoded_batches_become_their_own_shard() {
        let dir = tempdir().unwrap();
        let mut writer =
            ShardWriter::new(dir.path(), "train", features(), WriterOptions::default()).unwrap();
        writer.write(&example! { "content" => "a" }).unwrap();

        let mut batch = ColumnBatch::new(Arc::new(PhysicalLayout::new(features())));
        batch.push(&example! { "content" => "b" }).unwrap();
        batch.push(&example! { "content" => "c" }).unwrap();
        writer.write_encoded(&batch).unwrap();

        let summary = writer.finish().unwrap();
        let rows: Vec<_> = summary.shards.iter().map(|s| s.num_rows).collect();
        assert_eq!(rows, vec![1, 2]);
    }
}
