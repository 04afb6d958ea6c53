//! Column buffers for the physical layout
//!
//! A leaf column holds its values in a flat little-endian data buffer, an
//! optional value offsets buffer for variable-width kinds, and a validity bitmap
//! (1 = valid, 0 = null). Sequences contribute offsets groups that record how
//! many child elements belong to each parent element.
//!
//! The same borrowed views ([`LeafView`], [`GroupView`]) are produced by
//! in-memory [`ColumnBatch`]es and by memory-mapped shards, so decoding is
//! shared between both.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::features::ScalarKind;
use crate::layout::PhysicalLayout;
use crate::value::{Example, Value};

/// Access to the buffers of one physical layout
pub trait ColumnSource {
    /// Number of top-level rows
    fn num_rows(&self) -> usize;

    /// Offsets group by id
    fn group(&self, id: usize) -> Option<GroupView<'_>>;

    /// Leaf column by id
    fn leaf(&self, id: usize) -> Option<LeafView<'_>>;

    /// Where the buffers live, used in error messages
    fn origin(&self) -> &Path;
}

/// Borrowed view of an offsets group
#[derive(Debug, Clone, Copy)]
pub enum GroupView<'a> {
    /// Every parent element has exactly this many children
    Fixed(usize),

    /// Child range of parent `i` is `offsets[i]..offsets[i + 1]`
    Offsets(&'a [u64]),
}

impl GroupView<'_> {
    /// Child element range for a parent element
    pub fn range(&self, index: usize) -> Option<Range<usize>> {
        match self {
            GroupView::Fixed(length) => {
                let start = index.checked_mul(*length)?;
                Some(start..start.checked_add(*length)?)
            }
            GroupView::Offsets(offsets) => {
                let start = usize::try_from(*offsets.get(index)?).ok()?;
                let end = usize::try_from(*offsets.get(index.checked_add(1)?)?).ok()?;
                (start <= end).then_some(start..end)
            }
        }
    }
}

/// Borrowed view of a leaf column
#[derive(Debug, Clone, Copy)]
pub struct LeafView<'a> {
    kind: ScalarKind,
    data: &'a [u8],
    offsets: Option<&'a [u64]>,
    validity: Option<&'a [u8]>,
    len: usize,
}

impl<'a> LeafView<'a> {
    /// Create a view over raw buffers
    pub fn new(
        kind: ScalarKind,
        data: &'a [u8],
        offsets: Option<&'a [u64]>,
        validity: Option<&'a [u8]>,
        len: usize,
    ) -> Self {
        Self {
            kind,
            data,
            offsets,
            validity,
            len,
        }
    }

    /// Scalar kind of the values
    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the column has no values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw data buffer
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Check if the column contains any null
    pub fn has_nulls(&self) -> bool {
        self.validity.is_some()
    }

    /// Check if value `i` is non-null
    pub fn is_valid(&self, i: usize) -> bool {
        match self.validity {
            None => true,
            Some(bits) => bits.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0),
        }
    }

    fn fixed<const N: usize>(&self, i: usize) -> Option<[u8; N]> {
        let start = i.checked_mul(N)?;
        self.data.get(start..start.checked_add(N)?)?.try_into().ok()
    }

    fn variable(&self, i: usize) -> Option<&'a [u8]> {
        let offsets = self.offsets?;
        let start = usize::try_from(*offsets.get(i)?).ok()?;
        let end = usize::try_from(*offsets.get(i.checked_add(1)?)?).ok()?;
        self.data.get(start..end)
    }

    /// Decode value `i`. Returns `None` if the buffers are inconsistent.
    pub fn value(&self, i: usize) -> Option<Value> {
        if i >= self.len {
            return None;
        }
        if !self.is_valid(i) {
            return Some(Value::Null);
        }

        let value = match self.kind {
            ScalarKind::Bool => Value::Bool(*self.data.get(i)? != 0),
            ScalarKind::Int8 => Value::Int(i64::from(i8::from_le_bytes(self.fixed(i)?))),
            ScalarKind::Int16 => Value::Int(i64::from(i16::from_le_bytes(self.fixed(i)?))),
            ScalarKind::Int32 => Value::Int(i64::from(i32::from_le_bytes(self.fixed(i)?))),
            ScalarKind::Int64 => Value::Int(i64::from_le_bytes(self.fixed(i)?)),
            ScalarKind::UInt8 => Value::Int(i64::from(u8::from_le_bytes(self.fixed(i)?))),
            ScalarKind::UInt16 => Value::Int(i64::from(u16::from_le_bytes(self.fixed(i)?))),
            ScalarKind::UInt32 => Value::Int(i64::from(u32::from_le_bytes(self.fixed(i)?))),
            ScalarKind::UInt64 => {
                Value::Int(i64::try_from(u64::from_le_bytes(self.fixed(i)?)).ok()?)
            }
            ScalarKind::Float32 => Value::Float(f64::from(f32::from_le_bytes(self.fixed(i)?))),
            ScalarKind::Float64 => Value::Float(f64::from_le_bytes(self.fixed(i)?)),
            ScalarKind::String => Value::Str(std::str::from_utf8(self.variable(i)?).ok()?.to_owned()),
            ScalarKind::Binary => Value::Bytes(self.variable(i)?.to_vec()),
        };
        Some(value)
    }
}

/// Owned, growable buffers of one leaf column
#[derive(Debug, Clone)]
pub struct LeafBuffers {
    /// Scalar kind of the values
    kind: ScalarKind,

    /// Little-endian values, or concatenated bytes for variable-width kinds
    data: Vec<u8>,

    /// Value offsets for variable-width kinds, starting at 0
    offsets: Option<Vec<u64>>,

    /// Validity bitmap, one bit per value
    validity: Vec<u8>,

    /// Number of null values
    null_count: usize,

    /// Number of values
    len: usize,
}

fn narrow<T: TryFrom<i64>>(value: i64, kind: ScalarKind, path: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| Error::schema_mismatch(path, format!("{value} is out of range for {kind}")))
}

impl LeafBuffers {
    /// Create empty buffers for a kind
    pub fn new(kind: ScalarKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
            offsets: (!kind.is_fixed_width()).then(|| vec![0]),
            validity: Vec::new(),
            null_count: 0,
            len: 0,
        }
    }

    fn push_validity(&mut self, valid: bool) {
        if self.len % 8 == 0 {
            self.validity.push(0);
        }
        if valid {
            if let Some(byte) = self.validity.last_mut() {
                *byte |= 1 << (self.len % 8);
            }
        } else {
            self.null_count += 1;
        }
        self.len += 1;
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if let Some(offsets) = &mut self.offsets {
            offsets.push(self.data.len() as u64);
        }
    }

    /// Append a null value
    pub fn push_null(&mut self) {
        match self.kind.width() {
            Some(width) => self.data.resize(self.data.len() + width, 0),
            None => self.push_bytes(&[]),
        }
        self.push_validity(false);
    }

    /// Append a value that has already passed feature validation
    pub fn push(&mut self, value: &Value, path: &str) -> Result<()> {
        let kind = self.kind;
        match (kind, value) {
            (_, Value::Null) => {
                self.push_null();
                return Ok(());
            }
            (ScalarKind::Bool, Value::Bool(v)) => self.push_bytes(&[u8::from(*v)]),
            (ScalarKind::Int8, Value::Int(v)) => {
                self.push_bytes(&narrow::<i8>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::Int16, Value::Int(v)) => {
                self.push_bytes(&narrow::<i16>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::Int32, Value::Int(v)) => {
                self.push_bytes(&narrow::<i32>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::Int64, Value::Int(v)) => self.push_bytes(&v.to_le_bytes()),
            (ScalarKind::UInt8, Value::Int(v)) => {
                self.push_bytes(&narrow::<u8>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::UInt16, Value::Int(v)) => {
                self.push_bytes(&narrow::<u16>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::UInt32, Value::Int(v)) => {
                self.push_bytes(&narrow::<u32>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::UInt64, Value::Int(v)) => {
                self.push_bytes(&narrow::<u64>(*v, kind, path)?.to_le_bytes());
            }
            (ScalarKind::Float32, Value::Float(v)) => {
                #[allow(clippy::cast_possible_truncation)]
                let narrowed = *v as f32;
                self.push_bytes(&narrowed.to_le_bytes());
            }
            (ScalarKind::Float64, Value::Float(v)) => self.push_bytes(&v.to_le_bytes()),
            (ScalarKind::String, Value::Str(v)) => self.push_bytes(v.as_bytes()),
            (ScalarKind::Binary, Value::Bytes(v)) => self.push_bytes(v),
            (kind, other) => {
                return Err(Error::schema_mismatch(
                    path,
                    format!("expected {kind}, got {}", other.type_name()),
                ))
            }
        }
        self.push_validity(true);
        Ok(())
    }

    /// Scalar kind of the values
    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if there are no values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of null values
    pub fn null_count(&self) -> usize {
        self.null_count
    }

    /// Data buffer
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Value offsets, for variable-width kinds
    pub fn offsets(&self) -> Option<&[u64]> {
        self.offsets.as_deref()
    }

    /// Validity bitmap, present only when the column contains nulls
    pub fn validity(&self) -> Option<&[u8]> {
        (self.null_count > 0).then_some(self.validity.as_slice())
    }

    /// Borrowed view of the buffers
    pub fn view(&self) -> LeafView<'_> {
        LeafView::new(self.kind, &self.data, self.offsets(), self.validity(), self.len)
    }

    fn byte_size(&self) -> usize {
        self.data.len() + self.offsets.as_ref().map_or(0, |o| o.len() * 8) + self.validity.len()
    }
}

/// Owned offsets buffer of one sequence group
#[derive(Debug, Clone)]
pub struct GroupBuffers {
    fixed_len: Option<usize>,
    offsets: Vec<u64>,
}

impl GroupBuffers {
    /// Create an empty group; fixed-length groups keep no offsets
    pub fn new(fixed_len: Option<usize>) -> Self {
        Self {
            fixed_len,
            offsets: if fixed_len.is_some() { Vec::new() } else { vec![0] },
        }
    }

    /// Record the child count of the next parent element
    pub fn push_len(&mut self, len: usize) {
        if self.fixed_len.is_none() {
            let last = self.offsets.last().copied().unwrap_or(0);
            self.offsets.push(last + len as u64);
        }
    }

    /// Offsets, for variable-length groups
    pub fn offsets(&self) -> Option<&[u64]> {
        self.fixed_len.is_none().then_some(self.offsets.as_slice())
    }

    /// Borrowed view of the group
    pub fn view(&self) -> GroupView<'_> {
        match self.fixed_len {
            Some(length) => GroupView::Fixed(length),
            None => GroupView::Offsets(&self.offsets),
        }
    }
}

/// In-memory batch of encoded rows laid out per [`PhysicalLayout`]
#[derive(Debug, Clone)]
pub struct ColumnBatch {
    layout: Arc<PhysicalLayout>,
    num_rows: usize,
    groups: Vec<GroupBuffers>,
    leaves: Vec<LeafBuffers>,
}

impl ColumnBatch {
    /// Create an empty batch for a layout
    pub fn new(layout: Arc<PhysicalLayout>) -> Self {
        let groups = layout
            .groups()
            .iter()
            .map(|g| GroupBuffers::new(g.fixed_len))
            .collect();
        let leaves = layout
            .leaves()
            .iter()
            .map(|l| LeafBuffers::new(l.kind))
            .collect();
        Self {
            layout,
            num_rows: 0,
            groups,
            leaves,
        }
    }

    /// Validate and append one example.
    ///
    /// The example is fully validated before any buffer is touched, so a
    /// rejected example leaves the batch unchanged.
    pub fn push(&mut self, example: &Example) -> Result<()> {
        self.layout.features().validate(example)?;
        let layout = Arc::clone(&self.layout);
        layout.encode_row(example, self)?;
        self.num_rows += 1;
        Ok(())
    }

    /// Layout of this batch
    pub fn layout(&self) -> &Arc<PhysicalLayout> {
        &self.layout
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.num_rows
    }

    /// Check if the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Approximate size of the buffers in bytes
    pub fn byte_size(&self) -> usize {
        self.leaves.iter().map(LeafBuffers::byte_size).sum::<usize>()
            + self.groups.iter().map(|g| g.offsets.len() * 8).sum::<usize>()
    }

    /// Decode one row
    pub fn row(&self, index: usize) -> Result<Example> {
        if index >= self.num_rows {
            return Err(Error::IndexOutOfBounds {
                index: index as u64,
                len: self.num_rows as u64,
            });
        }
        self.layout.decode_row(self, index)
    }

    /// Offsets group buffers
    pub fn group_buffers(&self) -> &[GroupBuffers] {
        &self.groups
    }

    /// Leaf column buffers
    pub fn leaf_buffers(&self) -> &[LeafBuffers] {
        &self.leaves
    }

    pub(crate) fn group_mut(&mut self, id: usize) -> Result<&mut GroupBuffers> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no offsets group {id}")))
    }

    pub(crate) fn leaf_mut(&mut self, id: usize) -> Result<&mut LeafBuffers> {
        self.leaves
            .get_mut(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no leaf column {id}")))
    }
}

impl ColumnSource for ColumnBatch {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn group(&self, id: usize) -> Option<GroupView<'_>> {
        self.groups.get(id).map(GroupBuffers::view)
    }

    fn leaf(&self, id: usize) -> Option<LeafView<'_>> {
        self.leaves.get(id).map(LeafBuffers::view)
    }

    fn origin(&self) -> &Path {
        Path::new("<memory>")
    }
}
