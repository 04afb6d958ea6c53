//! Feature specifications describing the typed shape of dataset examples
//!
//! A [`Features`] value is the dataset schema: an ordered list of named
//! [`FeatureSpec`] trees. It validates incoming [`Value`]s and is the source from
//! which the physical column layout is derived (see [`crate::layout`]).

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{Example, Value};

/// Primitive type of a scalar leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Boolean (stored as one byte per value)
    Bool,

    /// 8-bit signed integer
    Int8,

    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit unsigned integer
    UInt16,

    /// 32-bit unsigned integer
    UInt32,

    /// 64-bit unsigned integer (values up to `i64::MAX`)
    UInt64,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,

    /// UTF-8 encoded string
    String,

    /// Binary data
    Binary,
}

impl ScalarKind {
    /// Width in bytes of one value, or `None` for variable-width kinds
    pub fn width(self) -> Option<usize> {
        match self {
            ScalarKind::Bool | ScalarKind::Int8 | ScalarKind::UInt8 => Some(1),
            ScalarKind::Int16 | ScalarKind::UInt16 => Some(2),
            ScalarKind::Int32 | ScalarKind::UInt32 | ScalarKind::Float32 => Some(4),
            ScalarKind::Int64 | ScalarKind::UInt64 | ScalarKind::Float64 => Some(8),
            ScalarKind::String | ScalarKind::Binary => None,
        }
    }

    /// Check if this kind has a fixed width
    pub fn is_fixed_width(self) -> bool {
        self.width().is_some()
    }

    fn int_range(self) -> Option<(i64, i64)> {
        match self {
            ScalarKind::Int8 => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            ScalarKind::Int16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            ScalarKind::Int32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            ScalarKind::Int64 => Some((i64::MIN, i64::MAX)),
            ScalarKind::UInt8 => Some((0, i64::from(u8::MAX))),
            ScalarKind::UInt16 => Some((0, i64::from(u16::MAX))),
            ScalarKind::UInt32 => Some((0, i64::from(u32::MAX))),
            ScalarKind::UInt64 => Some((0, i64::MAX)),
            _ => None,
        }
    }

    /// Name used in textual schemas
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int8 => "int8",
            ScalarKind::Int16 => "int16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::UInt8 => "uint8",
            ScalarKind::UInt16 => "uint16",
            ScalarKind::UInt32 => "uint32",
            ScalarKind::UInt64 => "uint64",
            ScalarKind::Float32 => "float32",
            ScalarKind::Float64 => "float64",
            ScalarKind::String => "string",
            ScalarKind::Binary => "binary",
        }
    }

    /// Check a scalar value against this kind
    pub fn validate(self, value: &Value, path: &str) -> Result<()> {
        match (self, value) {
            (_, Value::Null) => Ok(()),
            (ScalarKind::Bool, Value::Bool(_))
            | (ScalarKind::String, Value::Str(_))
            | (ScalarKind::Binary, Value::Bytes(_))
            | (ScalarKind::Float64, Value::Float(_)) => Ok(()),
            (ScalarKind::Float32, Value::Float(v)) => {
                #[allow(clippy::cast_possible_truncation)]
                let narrowed = *v as f32;
                if v.is_nan() || f64::from(narrowed) == *v {
                    Ok(())
                } else {
                    Err(Error::schema_mismatch(
                        path,
                        format!("{v} is not exactly representable as float32"),
                    ))
                }
            }
            (kind, Value::Int(v)) if kind.int_range().is_some() => {
                let (min, max) = kind.int_range().unwrap_or((i64::MIN, i64::MAX));
                if (min..=max).contains(v) {
                    Ok(())
                } else {
                    Err(Error::schema_mismatch(
                        path,
                        format!("{v} is out of range for {kind}"),
                    ))
                }
            }
            (kind, other) => Err(Error::schema_mismatch(
                path,
                format!("expected {kind}, got {}", other.type_name()),
            )),
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScalarKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "bool" => ScalarKind::Bool,
            "int8" => ScalarKind::Int8,
            "int16" => ScalarKind::Int16,
            "int32" => ScalarKind::Int32,
            "int64" => ScalarKind::Int64,
            "uint8" => ScalarKind::UInt8,
            "uint16" => ScalarKind::UInt16,
            "uint32" => ScalarKind::UInt32,
            "uint64" => ScalarKind::UInt64,
            "float32" | "float" => ScalarKind::Float32,
            "float64" | "double" => ScalarKind::Float64,
            "string" => ScalarKind::String,
            "binary" => ScalarKind::Binary,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unknown scalar type: {other}"
                )))
            }
        };
        Ok(kind)
    }
}

/// Categorical label with an ordered set of category names
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassLabel {
    names: Vec<String>,
}

impl ClassLabel {
    /// Create a label feature; names must be unique
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut seen = BTreeSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate class label name: {name}"
                )));
            }
        }
        Ok(Self { names })
    }

    /// Category names in index order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of categories
    pub fn num_classes(&self) -> usize {
        self.names.len()
    }

    /// Index of a category name
    pub fn str2int(&self, name: &str) -> Option<i64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| i64::try_from(i).ok())
    }

    /// Category name for an index
    pub fn int2str(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.names.get(i))
            .map(String::as_str)
    }

    /// Resolve a label value to its stored index. `-1` marks a missing label.
    pub fn encode(&self, value: &Value, path: &str) -> Result<i64> {
        match value {
            Value::Int(index) => {
                let in_range = *index == -1
                    || usize::try_from(*index).is_ok_and(|i| i < self.names.len());
                if in_range {
                    Ok(*index)
                } else {
                    Err(Error::schema_mismatch(
                        path,
                        format!(
                            "class index {index} outside -1..{}",
                            self.names.len()
                        ),
                    ))
                }
            }
            Value::Str(name) => self.str2int(name).ok_or_else(|| {
                Error::schema_mismatch(path, format!("unknown class label '{name}'"))
            }),
            other => Err(Error::schema_mismatch(
                path,
                format!("expected class label, got {}", other.type_name()),
            )),
        }
    }
}

/// Translation with a fixed set of languages per example
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Translation {
    languages: Vec<String>,
}

impl Translation {
    /// Create a translation feature; languages are kept sorted
    pub fn new<S: Into<String>>(languages: impl IntoIterator<Item = S>) -> Self {
        let set: BTreeSet<String> = languages.into_iter().map(Into::into).collect();
        Self {
            languages: set.into_iter().collect(),
        }
    }

    /// Sorted language codes
    pub fn languages(&self) -> &[String] {
        &self.languages
    }
}

/// Translation whose language set varies per example
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranslationVariableLanguages {
    languages: Option<Vec<String>>,
}

impl TranslationVariableLanguages {
    /// Accept any language
    pub fn any() -> Self {
        Self { languages: None }
    }

    /// Restrict examples to the given languages
    pub fn restricted<S: Into<String>>(languages: impl IntoIterator<Item = S>) -> Self {
        let set: BTreeSet<String> = languages.into_iter().map(Into::into).collect();
        Self {
            languages: Some(set.into_iter().collect()),
        }
    }

    /// Allowed languages, if restricted
    pub fn languages(&self) -> Option<&[String]> {
        self.languages.as_deref()
    }

    /// Flatten a translation value into sorted `(language, text)` pairs
    pub fn pairs(&self, value: &Value, path: &str) -> Result<Vec<(String, String)>> {
        let Value::Map(entries) = value else {
            return Err(Error::schema_mismatch(
                path,
                format!("expected translation map, got {}", value.type_name()),
            ));
        };

        let mut pairs = Vec::new();
        for (language, texts) in entries {
            if let Some(allowed) = &self.languages {
                if !allowed.iter().any(|l| l == language) {
                    return Err(Error::schema_mismatch(
                        path,
                        format!("language '{language}' not in {allowed:?}"),
                    ));
                }
            }
            match texts {
                Value::Str(text) => pairs.push((language.clone(), text.clone())),
                Value::List(items) if !items.is_empty() => {
                    for item in items {
                        let Value::Str(text) = item else {
                            return Err(Error::schema_mismatch(
                                format!("{path}.{language}"),
                                format!("expected string, got {}", item.type_name()),
                            ));
                        };
                        pairs.push((language.clone(), text.clone()));
                    }
                }
                other => {
                    return Err(Error::schema_mismatch(
                        format!("{path}.{language}"),
                        format!(
                            "expected string or non-empty list of strings, got {}",
                            other.type_name()
                        ),
                    ))
                }
            }
        }
        Ok(pairs)
    }

    /// Rebuild a translation value from `(language, text)` pairs. A language
    /// with a single text maps to a string, one with several texts to a list.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Value {
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (language, text) in pairs {
            grouped.entry(language).or_default().push(Value::Str(text));
        }
        Value::Map(
            grouped
                .into_iter()
                .map(|(language, mut texts)| {
                    let value = if texts.len() == 1 {
                        texts.pop().unwrap_or(Value::Null)
                    } else {
                        Value::List(texts)
                    };
                    (language, value)
                })
                .collect(),
        )
    }
}

/// Typed description of one field, possibly nested
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureSpec {
    /// Single primitive value
    Scalar(ScalarKind),

    /// Sequence with the same length in every example
    FixedSequence(Box<FeatureSpec>, usize),

    /// Sequence whose length varies per example
    VariableSequence(Box<FeatureSpec>),

    /// Ordered mapping of named sub-features
    Struct(Vec<(String, FeatureSpec)>),

    /// Categorical label stored as its integer index
    ClassLabel(ClassLabel),

    /// Fixed-language translation
    Translation(Translation),

    /// Variable-language translation
    TranslationVariableLanguages(TranslationVariableLanguages),
}

impl FeatureSpec {
    /// Scalar feature from its textual type name (`"string"`, `"int64"`, ...)
    pub fn value(kind: &str) -> Result<Self> {
        Ok(FeatureSpec::Scalar(kind.parse()?))
    }

    /// Variable-length sequence of `inner`
    pub fn sequence(inner: FeatureSpec) -> Self {
        FeatureSpec::VariableSequence(Box::new(inner))
    }

    /// Fixed-length sequence of `inner`
    pub fn fixed_sequence(inner: FeatureSpec, length: usize) -> Self {
        FeatureSpec::FixedSequence(Box::new(inner), length)
    }

    /// Struct from name/spec pairs, order preserved
    pub fn structure<S: Into<String>>(fields: impl IntoIterator<Item = (S, FeatureSpec)>) -> Self {
        FeatureSpec::Struct(fields.into_iter().map(|(n, s)| (n.into(), s)).collect())
    }

    /// Check a value against this spec. This is the single validation gate for
    /// dynamically-typed input; encoding assumes it has passed.
    pub fn validate(&self, value: &Value, path: &str) -> Result<()> {
        match self {
            FeatureSpec::Scalar(kind) => kind.validate(value, path),
            FeatureSpec::ClassLabel(label) => label.encode(value, path).map(|_| ()),
            FeatureSpec::Struct(fields) => {
                let Value::Map(entries) = value else {
                    return Err(Error::schema_mismatch(
                        path,
                        format!("expected struct, got {}", value.type_name()),
                    ));
                };
                for (name, spec) in fields {
                    let child = join_path(path, name);
                    let item = entries
                        .get(name)
                        .ok_or_else(|| Error::schema_mismatch(&child, "missing field"))?;
                    spec.validate(item, &child)?;
                }
                if entries.len() != fields.len() {
                    if let Some(extra) = entries
                        .keys()
                        .find(|k| !fields.iter().any(|(name, _)| name == *k))
                    {
                        return Err(Error::schema_mismatch(
                            join_path(path, extra),
                            "unexpected field",
                        ));
                    }
                }
                Ok(())
            }
            FeatureSpec::FixedSequence(inner, length) => {
                let items = sequence_items(inner, value, path)?;
                if items.len() != *length {
                    return Err(Error::schema_mismatch(
                        path,
                        format!("expected {length} elements, got {}", items.len()),
                    ));
                }
                for item in items.iter() {
                    inner.validate(item, path)?;
                }
                Ok(())
            }
            FeatureSpec::VariableSequence(inner) => {
                for item in sequence_items(inner, value, path)?.iter() {
                    inner.validate(item, path)?;
                }
                Ok(())
            }
            FeatureSpec::Translation(translation) => {
                let Value::Map(entries) = value else {
                    return Err(Error::schema_mismatch(
                        path,
                        format!("expected translation map, got {}", value.type_name()),
                    ));
                };
                let given: Vec<&String> = entries.keys().collect();
                let expected: Vec<&String> = translation.languages.iter().collect();
                if given != expected {
                    return Err(Error::schema_mismatch(
                        path,
                        format!("expected languages {expected:?}, got {given:?}"),
                    ));
                }
                for (language, text) in entries {
                    ScalarKind::String.validate(text, &join_path(path, language))?;
                    if text.is_null() {
                        return Err(Error::schema_mismatch(
                            join_path(path, language),
                            "translation text may not be null",
                        ));
                    }
                }
                Ok(())
            }
            FeatureSpec::TranslationVariableLanguages(translation) => {
                translation.pairs(value, path).map(|_| ())
            }
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureSpec::Scalar(kind) => write!(f, "{kind}"),
            FeatureSpec::FixedSequence(inner, length) => {
                write!(f, "Sequence[")?;
                inner.describe(f)?;
                write!(f, "; {length}]")
            }
            FeatureSpec::VariableSequence(inner) => {
                write!(f, "Sequence[")?;
                inner.describe(f)?;
                write!(f, "]")
            }
            FeatureSpec::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, spec)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: ")?;
                    spec.describe(f)?;
                }
                write!(f, "}}")
            }
            FeatureSpec::ClassLabel(label) => write!(f, "ClassLabel({})", label.names.join("|")),
            FeatureSpec::Translation(t) => write!(f, "Translation({})", t.languages.join("|")),
            FeatureSpec::TranslationVariableLanguages(t) => match &t.languages {
                Some(languages) => write!(f, "TranslationVariableLanguages({})", languages.join("|")),
                None => write!(f, "TranslationVariableLanguages(*)"),
            },
        }
    }

    /// Infer a spec from a sample value. Empty lists and nulls carry no type
    /// information and are rejected.
    pub fn infer(value: &Value, path: &str) -> Result<Self> {
        let spec = match value {
            Value::Int(_) => FeatureSpec::Scalar(ScalarKind::Int64),
            Value::Float(_) => FeatureSpec::Scalar(ScalarKind::Float64),
            Value::Bool(_) => FeatureSpec::Scalar(ScalarKind::Bool),
            Value::Str(_) => FeatureSpec::Scalar(ScalarKind::String),
            Value::Bytes(_) => FeatureSpec::Scalar(ScalarKind::Binary),
            Value::List(items) => {
                let first = items.iter().find(|v| !v.is_null()).ok_or_else(|| {
                    Error::schema_mismatch(path, "cannot infer element type of an empty list")
                })?;
                FeatureSpec::sequence(FeatureSpec::infer(first, path)?)
            }
            Value::Map(entries) => FeatureSpec::Struct(
                entries
                    .iter()
                    .map(|(name, v)| Ok((name.clone(), FeatureSpec::infer(v, &join_path(path, name))?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Null => {
                return Err(Error::schema_mismatch(path, "cannot infer type of a null value"))
            }
        };
        Ok(spec)
    }
}

impl fmt::Display for FeatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f)
    }
}

/// Join a parent path and a child name with a dot
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

/// Elements of a sequence value.
///
/// A sequence of structs may be given either as a list of maps or in columnar
/// form (a map of equal-length lists); both normalise to a list of maps.
pub(crate) fn sequence_items<'a>(
    inner: &FeatureSpec,
    value: &'a Value,
    path: &str,
) -> Result<Cow<'a, [Value]>> {
    match (inner, value) {
        (_, Value::List(items)) => Ok(Cow::Borrowed(items.as_slice())),
        (FeatureSpec::Struct(fields), Value::Map(columns)) => {
            let mut length: Option<usize> = None;
            for (name, _) in fields {
                let child = join_path(path, name);
                let column = columns
                    .get(name)
                    .ok_or_else(|| Error::schema_mismatch(&child, "missing field"))?;
                let Value::List(items) = column else {
                    return Err(Error::schema_mismatch(
                        &child,
                        format!("expected list, got {}", column.type_name()),
                    ));
                };
                match length {
                    None => length = Some(items.len()),
                    Some(n) if n != items.len() => {
                        return Err(Error::schema_mismatch(
                            &child,
                            format!("expected {n} elements like sibling fields, got {}", items.len()),
                        ))
                    }
                    Some(_) => {}
                }
            }
            if let Some(extra) = columns
                .keys()
                .find(|k| !fields.iter().any(|(name, _)| name == *k))
            {
                return Err(Error::schema_mismatch(join_path(path, extra), "unexpected field"));
            }

            let length = length.unwrap_or(0);
            let mut rows = Vec::with_capacity(length);
            for i in 0..length {
                let row = fields
                    .iter()
                    .filter_map(|(name, _)| {
                        columns
                            .get(name)
                            .and_then(Value::as_list)
                            .and_then(|items| items.get(i))
                            .map(|v| (name.clone(), v.clone()))
                    })
                    .collect();
                rows.push(Value::Map(row));
            }
            Ok(Cow::Owned(rows))
        }
        (_, other) => Err(Error::schema_mismatch(
            path,
            format!("expected sequence, got {}", other.type_name()),
        )),
    }
}

/// A named top-level feature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Name of the field
    pub name: String,

    /// Feature specification of the field
    pub spec: FeatureSpec,
}

impl Field {
    /// Create a new field
    pub fn new(name: &str, spec: FeatureSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }
}

/// Dataset schema: ordered mapping from field name to feature specification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Features {
    fields: Vec<Field>,
}

impl Features {
    /// Create a schema; field names must be unique
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate field name: {}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Create a schema from name/spec pairs
    pub fn from_pairs<S: AsRef<str>>(pairs: impl IntoIterator<Item = (S, FeatureSpec)>) -> Result<Self> {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, spec)| Field::new(name.as_ref(), spec))
                .collect(),
        )
    }

    /// All fields in order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the schema has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in order
    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Index of a field by name
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    /// Spec of a field by name
    pub fn get(&self, name: &str) -> Option<&FeatureSpec> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.spec)
    }

    /// Schema restricted to the given fields, in the requested order
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let fields = names
            .iter()
            .map(|name| {
                let index = self.index_of(name.as_ref())?;
                Ok(self.fields[index].clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(fields)
    }

    /// Schema without the given fields
    pub fn remove<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        for name in names {
            self.index_of(name.as_ref())?;
        }
        Ok(Self {
            fields: self
                .fields
                .iter()
                .filter(|f| !names.iter().any(|n| n.as_ref() == f.name))
                .cloned()
                .collect(),
        })
    }

    /// Schema with one field renamed
    pub fn rename(&self, old: &str, new: &str) -> Result<Self> {
        let index = self.index_of(old)?;
        if old != new && self.get(new).is_some() {
            return Err(Error::InvalidArgument(format!("field {new} already exists")));
        }
        let mut fields = self.fields.clone();
        fields[index].name = new.to_string();
        Ok(Self { fields })
    }

    /// Validate a complete example against this schema
    pub fn validate(&self, example: &Example) -> Result<()> {
        for field in &self.fields {
            let value = example
                .get(&field.name)
                .ok_or_else(|| Error::schema_mismatch(&field.name, "missing field"))?;
            field.spec.validate(value, &field.name)?;
        }
        if example.len() != self.fields.len() {
            if let Some(extra) = example.keys().find(|k| self.get(k).is_none()) {
                return Err(Error::schema_mismatch(extra, "unexpected field"));
            }
        }
        Ok(())
    }

    /// Infer a schema from a sample example
    pub fn infer(example: &Example) -> Result<Self> {
        Self::new(
            example
                .iter()
                .map(|(name, value)| Ok(Field::new(name, FeatureSpec::infer(value, name)?)))
                .collect::<Result<Vec<_>>>()?,
        )
    }

    /// Serialize this schema to a binary format
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::Serialization)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.spec)?;
        }
        write!(f, "}}")
    }
}
