//! File utilities: read-only memory maps and atomic publication

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Read-only memory-mapped file for zero-copy access
pub struct MemoryMappedFile {
    /// The memory map, absent for empty files which cannot be mapped
    mmap: Option<Mmap>,

    /// The path to the file
    path: PathBuf,
}

impl MemoryMappedFile {
    /// Open a file for memory-mapped reading
    #[allow(unsafe_code)]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();

        let mmap = if size == 0 {
            None
        } else {
            // SAFETY: shard files are published by rename and never modified
            // in place afterwards.
            Some(unsafe { MmapOptions::new().map(&file)? })
        };

        Ok(Self { mmap, path })
    }

    /// Get the whole mapped file
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Get a subslice of the mapped file
    pub fn slice(&self, offset: usize, length: usize) -> Result<&[u8]> {
        let end = offset.checked_add(length).ok_or_else(|| {
            Error::corrupt(&self.path, "buffer range overflows")
        })?;
        self.as_slice().get(offset..end).ok_or_else(|| {
            Error::corrupt(
                &self.path,
                format!("range {offset}..{end} exceeds file size {}", self.size()),
            )
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the size of the file
    pub fn size(&self) -> usize {
        self.as_slice().len()
    }
}

impl std::fmt::Debug for MemoryMappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMappedFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

/// Removes a staged path on drop unless it was published
pub struct StagedPath {
    path: PathBuf,
    armed: bool,
}

impl StagedPath {
    /// Guard a temporary path
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The temporary path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop guarding; the path is no longer removed on drop
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagedPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        if let Err(err) = result {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove staged path");
            }
        }
    }
}

/// Hidden temporary name next to `target`: `.<name>.tmp-<uuid>`
pub fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = format!(".{name}.tmp-{}", Uuid::new_v4().simple());
    target.with_file_name(staged)
}

/// Write a file atomically: the contents are written to a staged sibling,
/// flushed and synced, then renamed over `path`. Readers never observe a
/// partial file.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let mut guard = StagedPath::new(staging_path(path));
    let file = File::create(guard.path())?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush()?;

    let file = writer
        .into_inner()
        .map_err(|err| Error::Io(err.into_error()))?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    drop(file);

    fs::rename(guard.path(), path)?;
    guard.disarm();
    Ok(size)
}

/// Serialize a value as pretty JSON and publish it atomically
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        Ok(())
    })?;
    Ok(())
}

/// Read and parse a JSON file
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
