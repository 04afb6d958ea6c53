//! Immutable columnar shard files
//!
//! Layout of a shard file:
//!
//! ```text
//! "MLDSHRD1"          magic
//! buffers...          each starting at an 8-byte aligned offset
//! footer              bincode(ShardFooter)
//! footer_len          u64 little-endian
//! "MLDSHRD1"          trailing magic
//! ```
//!
//! Buffers are stored in native little-endian order so that offsets and
//! fixed-width values can be reinterpreted in place from the memory map.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::column::{ColumnBatch, ColumnSource, GroupView, LeafView};
use crate::error::{Error, Result};
use crate::features::Features;
use crate::io::{write_atomic, MemoryMappedFile};
use crate::layout::PhysicalLayout;
use crate::value::Example;

const_assert!(cfg!(target_endian = "little"));

/// Leading and trailing file magic
pub const SHARD_MAGIC: &[u8; 8] = b"MLDSHRD1";

/// Current shard format version
pub const FORMAT_VERSION: u32 = 1;

const ALIGNMENT: u64 = 8;

/// Location of one buffer inside a shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRef {
    /// Byte offset from the start of the file
    pub offset: u64,

    /// Length in bytes
    pub len: u64,
}

/// Buffers of one leaf column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRefs {
    /// Values buffer
    pub data: BufferRef,

    /// Value offsets, for strings and binary
    pub offsets: Option<BufferRef>,

    /// Validity bitmap, present when the column has nulls
    pub validity: Option<BufferRef>,

    /// Number of values
    pub len: u64,

    /// Number of null values
    pub null_count: u64,
}

/// Directory of every buffer in a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDirectory {
    /// Offsets buffer per group (`None` for fixed-length groups)
    pub groups: Vec<Option<BufferRef>>,

    /// Buffers per leaf column
    pub leaves: Vec<LeafRefs>,
}

/// Trailing metadata of a shard file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFooter {
    /// Format version of the file
    pub format_version: u32,

    /// Embedded schema
    pub features: Features,

    /// Number of rows
    pub row_count: u64,

    /// Buffer locations
    pub buffers: BufferDirectory,

    /// blake3 digest of the schema and every buffer
    pub digest: [u8; 32],
}

/// Description of a published shard file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardFileInfo {
    /// File name relative to the split directory
    pub file_name: String,

    /// Number of rows in the shard
    pub num_rows: u64,

    /// Size of the file in bytes
    pub num_bytes: u64,

    /// Hex-encoded content digest
    pub digest: String,
}

struct BufferSink<'a, W: Write> {
    writer: &'a mut W,
    position: u64,
    hasher: blake3::Hasher,
}

impl<W: Write> BufferSink<'_, W> {
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn buffer(&mut self, bytes: &[u8]) -> Result<BufferRef> {
        let padding = (ALIGNMENT - self.position % ALIGNMENT) % ALIGNMENT;
        self.write_raw(&[0u8; 8][..padding as usize])?;

        let offset = self.position;
        self.write_raw(bytes)?;
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        Ok(BufferRef {
            offset,
            len: bytes.len() as u64,
        })
    }
}

/// Write a batch as a shard file. The file is staged under a temporary name,
/// synced, and renamed into place.
pub fn write_shard(path: &Path, batch: &ColumnBatch) -> Result<ShardFileInfo> {
    let features = batch.layout().features().clone();
    let mut digest = [0u8; 32];

    let num_bytes = write_atomic(path, |writer| {
        let mut sink = BufferSink {
            writer,
            position: 0,
            hasher: blake3::Hasher::new(),
        };
        sink.hasher.update(b"ml-datasets/shard/v1");
        sink.hasher.update(&features.serialize()?);
        sink.write_raw(SHARD_MAGIC)?;

        let groups = batch
            .group_buffers()
            .iter()
            .map(|group| {
                group
                    .offsets()
                    .map(|offsets| sink.buffer(bytemuck::cast_slice(offsets)))
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;

        let leaves = batch
            .leaf_buffers()
            .iter()
            .map(|leaf| {
                Ok(LeafRefs {
                    data: sink.buffer(leaf.data())?,
                    offsets: leaf
                        .offsets()
                        .map(|offsets| sink.buffer(bytemuck::cast_slice(offsets)))
                        .transpose()?,
                    validity: leaf.validity().map(|bits| sink.buffer(bits)).transpose()?,
                    len: leaf.len() as u64,
                    null_count: leaf.null_count() as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        digest = *sink.hasher.finalize().as_bytes();
        let footer = ShardFooter {
            format_version: FORMAT_VERSION,
            features: features.clone(),
            row_count: batch.len() as u64,
            buffers: BufferDirectory { groups, leaves },
            digest,
        };

        // Footer, its length, trailing magic
        let encoded = bincode::serialize(&footer)?;
        sink.write_raw(&encoded)?;
        sink.write_raw(&(encoded.len() as u64).to_le_bytes())?;
        sink.write_raw(SHARD_MAGIC)?;
        Ok(())
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tracing::debug!(path = %path.display(), rows = batch.len(), bytes = num_bytes, "flushed shard");

    Ok(ShardFileInfo {
        file_name,
        num_rows: batch.len() as u64,
        num_bytes,
        digest: blake3::Hash::from(digest).to_hex().to_string(),
    })
}

/// A memory-mapped, validated shard file
#[derive(Debug)]
pub struct Shard {
    file: MemoryMappedFile,
    footer: ShardFooter,
    layout: Arc<PhysicalLayout>,
}

impl Shard {
    /// Map a shard file and validate its structure
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = MemoryMappedFile::open(path)?;
        let path = file.path().to_path_buf();
        let bytes = file.as_slice();

        let trailer = SHARD_MAGIC.len() + 8;
        if bytes.len() < SHARD_MAGIC.len() + trailer {
            return Err(Error::corrupt(&path, format!("truncated file of {} bytes", bytes.len())));
        }
        if &bytes[..SHARD_MAGIC.len()] != SHARD_MAGIC || &bytes[bytes.len() - SHARD_MAGIC.len()..] != SHARD_MAGIC {
            return Err(Error::corrupt(&path, "bad magic"));
        }

        let len_start = bytes.len() - trailer;
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[len_start..len_start + 8]);
        let footer_len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| Error::corrupt(&path, "footer length overflows"))?;
        let footer_start = len_start
            .checked_sub(footer_len)
            .filter(|start| *start >= SHARD_MAGIC.len())
            .ok_or_else(|| Error::corrupt(&path, "footer length exceeds file size"))?;

        let footer: ShardFooter = bincode::deserialize(&bytes[footer_start..len_start])
            .map_err(|err| Error::corrupt(&path, format!("unreadable footer: {err}")))?;
        if footer.format_version != FORMAT_VERSION {
            return Err(Error::corrupt(
                &path,
                format!("unsupported format version {}", footer.format_version),
            ));
        }

        let layout = Arc::new(PhysicalLayout::new(footer.features.clone()));
        let shard = Self { file, footer, layout };
        shard.validate(footer_start as u64)?;

        tracing::debug!(path = %path.display(), rows = shard.footer.row_count, "opened shard");
        Ok(shard)
    }

    /// Open a shard and require its embedded schema to equal `expected`
    pub fn open_expecting<P: AsRef<Path>>(path: P, expected: &Features) -> Result<Self> {
        let shard = Self::open(path)?;
        if shard.features() != expected {
            return Err(Error::SchemaVersionMismatch {
                path: shard.path().to_path_buf(),
                expected: expected.to_string(),
                found: shard.features().to_string(),
            });
        }
        Ok(shard)
    }

    fn check_ref(&self, buffer: &BufferRef, data_end: u64) -> Result<()> {
        let end = buffer.offset.checked_add(buffer.len);
        if buffer.offset % ALIGNMENT != 0 || end.map_or(true, |end| end > data_end) {
            return Err(Error::corrupt(
                self.path(),
                format!("buffer {}+{} out of range", buffer.offset, buffer.len),
            ));
        }
        Ok(())
    }

    fn validate(&self, data_end: u64) -> Result<()> {
        let directory = &self.footer.buffers;
        if directory.groups.len() != self.layout.groups().len()
            || directory.leaves.len() != self.layout.leaves().len()
        {
            return Err(Error::corrupt(self.path(), "buffer directory does not match schema"));
        }

        for buffer in directory.groups.iter().flatten() {
            self.check_ref(buffer, data_end)?;
        }
        for leaf in &directory.leaves {
            self.check_ref(&leaf.data, data_end)?;
            for buffer in leaf.offsets.iter().chain(leaf.validity.iter()) {
                self.check_ref(buffer, data_end)?;
            }
        }

        // Element counts implied by each group, checked against its offsets
        let row_count = self.to_usize(self.footer.row_count)?;
        let mut children = Vec::with_capacity(self.layout.groups().len());
        for (id, group) in self.layout.groups().iter().enumerate() {
            let parents = group.parent.map_or(row_count, |p| children[p]);
            let count = match (group.fixed_len, self.group(id)) {
                (Some(length), Some(GroupView::Fixed(_))) => parents
                    .checked_mul(length)
                    .ok_or_else(|| Error::corrupt(self.path(), "group size overflows"))?,
                (None, Some(GroupView::Offsets(offsets))) if offsets.len() == parents + 1 => {
                    self.to_usize(offsets[parents])?
                }
                _ => {
                    return Err(Error::corrupt(
                        self.path(),
                        format!("offsets of group {} inconsistent", group.path),
                    ))
                }
            };
            children.push(count);
        }

        for (id, leaf) in self.layout.leaves().iter().enumerate() {
            let expected = leaf.group.map_or(row_count, |g| children[g]);
            let refs = &directory.leaves[id];
            let len = self.to_usize(refs.len)?;
            let data_len = self.to_usize(refs.data.len)?;
            let consistent = len == expected
                && refs.offsets.is_some() != leaf.kind.is_fixed_width()
                && refs.validity.map_or(true, |v| v.len >= (refs.len + 7) / 8)
                && match leaf.kind.width() {
                    Some(width) => data_len == len * width,
                    None => self
                        .offsets_slice(refs.offsets)
                        .is_some_and(|o| o.len() == len + 1 && o.last().is_some_and(|last| *last as usize <= data_len)),
                };
            if !consistent {
                return Err(Error::corrupt(
                    self.path(),
                    format!("column {} inconsistent with {expected} expected values", leaf.path),
                ));
            }
        }
        Ok(())
    }

    fn to_usize(&self, value: u64) -> Result<usize> {
        usize::try_from(value).map_err(|_| Error::corrupt(self.path(), "size overflows"))
    }

    fn bytes(&self, buffer: BufferRef) -> Option<&[u8]> {
        let start = usize::try_from(buffer.offset).ok()?;
        let end = start.checked_add(usize::try_from(buffer.len).ok()?)?;
        self.file.as_slice().get(start..end)
    }

    fn offsets_slice(&self, buffer: Option<BufferRef>) -> Option<&[u64]> {
        bytemuck::try_cast_slice(self.bytes(buffer?)?).ok()
    }

    /// Recompute the content digest and compare it with the footer
    pub fn verify_digest(&self) -> Result<()> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ml-datasets/shard/v1");
        hasher.update(&self.footer.features.serialize()?);

        let directory = &self.footer.buffers;
        let buffers = directory.groups.iter().flatten().copied().chain(
            directory
                .leaves
                .iter()
                .flat_map(|l| std::iter::once(l.data).chain(l.offsets).chain(l.validity)),
        );
        for buffer in buffers {
            let bytes = self
                .bytes(buffer)
                .ok_or_else(|| Error::corrupt(self.path(), "buffer out of range"))?;
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }

        if hasher.finalize().as_bytes() != &self.footer.digest {
            return Err(Error::corrupt(self.path(), "content digest mismatch"));
        }
        Ok(())
    }

    /// Path of the shard file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Embedded schema
    pub fn features(&self) -> &Features {
        &self.footer.features
    }

    /// Physical layout of the embedded schema
    pub fn layout(&self) -> &Arc<PhysicalLayout> {
        &self.layout
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.footer.row_count as usize
    }

    /// Check if the shard has no rows
    pub fn is_empty(&self) -> bool {
        self.footer.row_count == 0
    }

    /// Content digest
    pub fn digest(&self) -> &[u8; 32] {
        &self.footer.digest
    }

    /// Size of the file in bytes
    pub fn file_size(&self) -> usize {
        self.file.size()
    }

    /// Describe this shard for a split manifest
    pub fn info(&self) -> ShardFileInfo {
        ShardFileInfo {
            file_name: self
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            num_rows: self.footer.row_count,
            num_bytes: self.file.size() as u64,
            digest: blake3::Hash::from(self.footer.digest).to_hex().to_string(),
        }
    }

    /// Decode one row
    pub fn row(&self, index: usize) -> Result<Example> {
        if index >= self.len() {
            return Err(Error::IndexOutOfBounds {
                index: index as u64,
                len: self.footer.row_count,
            });
        }
        self.layout.decode_row(self, index)
    }
}

impl ColumnSource for Shard {
    fn num_rows(&self) -> usize {
        self.len()
    }

    fn group(&self, id: usize) -> Option<GroupView<'_>> {
        let group = self.layout.groups().get(id)?;
        match (group.fixed_len, self.footer.buffers.groups.get(id)?) {
            (Some(length), None) => Some(GroupView::Fixed(length)),
            (None, Some(buffer)) => self.offsets_slice(Some(*buffer)).map(GroupView::Offsets),
            _ => None,
        }
    }

    fn leaf(&self, id: usize) -> Option<LeafView<'_>> {
        let leaf = self.layout.leaves().get(id)?;
        let refs = self.footer.buffers.leaves.get(id)?;
        let offsets = match refs.offsets {
            Some(buffer) => Some(self.offsets_slice(Some(buffer))?),
            None => None,
        };
        let validity = match refs.validity {
            Some(buffer) => Some(self.bytes(buffer)?),
            None => None,
        };
        Some(LeafView::new(
            leaf.kind,
            self.bytes(refs.data)?,
            offsets,
            validity,
            usize::try_from(refs.len).ok()?,
        ))
    }

    fn origin(&self) -> &Path {
        self.path()
    }
}

/// Shard file name for a prefix and sequence number
pub fn shard_file_name(prefix: &str, index: usize) -> String {
    format!("{prefix}-{index:05}.shard")
}

/// Paths of shard files listed in a manifest
pub fn shard_paths(dir: &Path, shards: &[ShardFileInfo]) -> Vec<PathBuf> {
    shards.iter().map(|s| dir.join(&s.file_name)).collect()
}
