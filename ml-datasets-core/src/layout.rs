//! Physical column layout derived from a feature schema
//!
//! Every scalar leaf of the schema becomes one physical column and every
//! sequence becomes an offsets group shared by all leaves below it
//! (struct-of-arrays flattening). A `Sequence(Struct{a, b})` field therefore
//! yields one group and two leaf columns, `x.a` and `x.b`, both pointing at that
//! group.
//!
//! Groups and leaves are numbered in depth-first traversal order of the schema,
//! so the layout is a deterministic function of the [`Features`].
//!
//! Decoding yields a canonical form, which may differ from the value that was
//! encoded while describing the same data:
//!
//! - a sequence of structs decodes to a map of lists (`{"b": [x, y]}`), even
//!   when it was written as a list of maps (`[{"b": x}, {"b": y}]`);
//! - a variable-language translation decodes each language with exactly one
//!   text to a string and each language with several texts to a list;
//! - class labels decode to their integer index.
//!
//! Encoding a canonical value and decoding it again returns it unchanged.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::column::{ColumnBatch, ColumnSource};
use crate::error::{Error, Result};
use crate::features::{
    join_path, sequence_items, ClassLabel, FeatureSpec, Features, ScalarKind,
    TranslationVariableLanguages,
};
use crate::value::{Example, Value};

/// A sequence level: maps each parent element to a range of child elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetGroup {
    /// Dotted path of the sequence, suffixed with `[]`
    pub path: String,

    /// Enclosing group, or `None` when parents are top-level rows
    pub parent: Option<usize>,

    /// Child count per parent for fixed-length sequences
    pub fixed_len: Option<usize>,
}

/// One physical column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafColumn {
    /// Dotted path of the leaf
    pub path: String,

    /// Stored scalar kind
    pub kind: ScalarKind,

    /// Innermost enclosing group, or `None` for one value per row
    pub group: Option<usize>,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(usize),
    Label(usize, ClassLabel),
    Sequence {
        group: usize,
        item: FeatureSpec,
        inner: Box<Node>,
    },
    Struct(Vec<(String, Node)>),
    Translation(Vec<(String, usize)>),
    VariableTranslation {
        group: usize,
        language: usize,
        text: usize,
        spec: TranslationVariableLanguages,
    },
}

/// Layout of one top-level field
#[derive(Debug, Clone)]
pub struct FieldLayout {
    /// Field name
    pub name: String,

    /// Leaf columns belonging to this field
    pub leaves: Range<usize>,

    /// Offsets groups belonging to this field
    pub groups: Range<usize>,

    node: Node,
}

impl FieldLayout {
    /// Leaf id if this field is a single top-level scalar column
    pub fn scalar_leaf(&self) -> Option<usize> {
        match self.node {
            Node::Leaf(id) | Node::Label(id, _) => Some(id),
            _ => None,
        }
    }
}

/// Flattened physical layout of a [`Features`] schema
#[derive(Debug, Clone)]
pub struct PhysicalLayout {
    features: Features,
    groups: Vec<OffsetGroup>,
    leaves: Vec<LeafColumn>,
    fields: Vec<FieldLayout>,
}

#[derive(Default)]
struct LayoutBuilder {
    groups: Vec<OffsetGroup>,
    leaves: Vec<LeafColumn>,
}

impl LayoutBuilder {
    fn leaf(&mut self, path: String, kind: ScalarKind, group: Option<usize>) -> usize {
        self.leaves.push(LeafColumn { path, kind, group });
        self.leaves.len() - 1
    }

    fn group(&mut self, path: &str, parent: Option<usize>, fixed_len: Option<usize>) -> usize {
        self.groups.push(OffsetGroup {
            path: format!("{path}[]"),
            parent,
            fixed_len,
        });
        self.groups.len() - 1
    }

    fn visit(&mut self, spec: &FeatureSpec, path: &str, group: Option<usize>) -> Node {
        match spec {
            FeatureSpec::Scalar(kind) => Node::Leaf(self.leaf(path.to_string(), *kind, group)),
            FeatureSpec::ClassLabel(label) => Node::Label(
                self.leaf(path.to_string(), ScalarKind::Int64, group),
                label.clone(),
            ),
            FeatureSpec::FixedSequence(inner, length) => {
                let id = self.group(path, group, Some(*length));
                Node::Sequence {
                    group: id,
                    item: (**inner).clone(),
                    inner: Box::new(self.visit(inner, path, Some(id))),
                }
            }
            FeatureSpec::VariableSequence(inner) => {
                let id = self.group(path, group, None);
                Node::Sequence {
                    group: id,
                    item: (**inner).clone(),
                    inner: Box::new(self.visit(inner, path, Some(id))),
                }
            }
            FeatureSpec::Struct(fields) => Node::Struct(
                fields
                    .iter()
                    .map(|(name, child)| (name.clone(), self.visit(child, &join_path(path, name), group)))
                    .collect(),
            ),
            FeatureSpec::Translation(translation) => Node::Translation(
                translation
                    .languages()
                    .iter()
                    .map(|language| {
                        let id = self.leaf(join_path(path, language), ScalarKind::String, group);
                        (language.clone(), id)
                    })
                    .collect(),
            ),
            FeatureSpec::TranslationVariableLanguages(spec) => {
                let id = self.group(path, group, None);
                Node::VariableTranslation {
                    group: id,
                    language: self.leaf(join_path(path, "language"), ScalarKind::String, Some(id)),
                    text: self.leaf(join_path(path, "translation"), ScalarKind::String, Some(id)),
                    spec: spec.clone(),
                }
            }
        }
    }
}

impl PhysicalLayout {
    /// Derive the layout of a schema
    pub fn new(features: Features) -> Self {
        let mut builder = LayoutBuilder::default();
        let mut fields = Vec::with_capacity(features.len());

        for field in features.fields() {
            let leaf_start = builder.leaves.len();
            let group_start = builder.groups.len();
            let node = builder.visit(&field.spec, &field.name, None);
            fields.push(FieldLayout {
                name: field.name.clone(),
                leaves: leaf_start..builder.leaves.len(),
                groups: group_start..builder.groups.len(),
                node,
            });
        }

        Self {
            features,
            groups: builder.groups,
            leaves: builder.leaves,
            fields,
        }
    }

    /// Schema this layout was derived from
    pub fn features(&self) -> &Features {
        &self.features
    }

    /// All offsets groups in traversal order
    pub fn groups(&self) -> &[OffsetGroup] {
        &self.groups
    }

    /// All leaf columns in traversal order
    pub fn leaves(&self) -> &[LeafColumn] {
        &self.leaves
    }

    /// Per-field layouts in schema order
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    /// Encode a validated example into a batch
    pub(crate) fn encode_row(&self, example: &Example, batch: &mut ColumnBatch) -> Result<()> {
        for field in &self.fields {
            let value = example
                .get(&field.name)
                .ok_or_else(|| Error::schema_mismatch(&field.name, "missing field"))?;
            encode(&field.node, value, &field.name, batch)?;
        }
        Ok(())
    }

    /// Decode a full row into its canonical form (see the module docs)
    pub fn decode_row<S: ColumnSource + ?Sized>(&self, source: &S, row: usize) -> Result<Example> {
        self.fields
            .iter()
            .map(|field| Ok((field.name.clone(), decode(&field.node, source, row)?)))
            .collect()
    }

    /// Decode one field of a row
    pub fn decode_field<S: ColumnSource + ?Sized>(
        &self,
        source: &S,
        field: usize,
        row: usize,
    ) -> Result<Value> {
        let layout = self.fields.get(field).ok_or(Error::IndexOutOfBounds {
            index: field as u64,
            len: self.fields.len() as u64,
        })?;
        decode(&layout.node, source, row)
    }
}

fn encode(node: &Node, value: &Value, path: &str, batch: &mut ColumnBatch) -> Result<()> {
    match node {
        Node::Leaf(id) => batch.leaf_mut(*id)?.push(value, path),
        Node::Label(id, label) => {
            let index = label.encode(value, path)?;
            batch.leaf_mut(*id)?.push(&Value::Int(index), path)
        }
        Node::Sequence { group, item, inner } => {
            let items = sequence_items(item, value, path)?;
            batch.group_mut(*group)?.push_len(items.len());
            for element in items.iter() {
                encode(inner, element, path, batch)?;
            }
            Ok(())
        }
        Node::Struct(fields) => {
            for (name, child) in fields {
                let child_path = join_path(path, name);
                let child_value = value
                    .as_map()
                    .and_then(|entries| entries.get(name))
                    .ok_or_else(|| Error::schema_mismatch(&child_path, "missing field"))?;
                encode(child, child_value, &child_path, batch)?;
            }
            Ok(())
        }
        Node::Translation(languages) => {
            for (language, id) in languages {
                let child_path = join_path(path, language);
                let text = value
                    .as_map()
                    .and_then(|entries| entries.get(language))
                    .ok_or_else(|| Error::schema_mismatch(&child_path, "missing language"))?;
                batch.leaf_mut(*id)?.push(text, &child_path)?;
            }
            Ok(())
        }
        Node::VariableTranslation {
            group,
            language,
            text,
            spec,
        } => {
            let pairs = spec.pairs(value, path)?;
            batch.group_mut(*group)?.push_len(pairs.len());
            for (lang, translation) in pairs {
                batch.leaf_mut(*language)?.push(&Value::Str(lang), path)?;
                batch.leaf_mut(*text)?.push(&Value::Str(translation), path)?;
            }
            Ok(())
        }
    }
}

fn leaf_value<S: ColumnSource + ?Sized>(source: &S, id: usize, index: usize) -> Result<Value> {
    source
        .leaf(id)
        .and_then(|leaf| leaf.value(index))
        .ok_or_else(|| Error::corrupt(source.origin(), format!("leaf {id} has no valid value {index}")))
}

fn group_range<S: ColumnSource + ?Sized>(source: &S, id: usize, index: usize) -> Result<Range<usize>> {
    source
        .group(id)
        .and_then(|group| group.range(index))
        .ok_or_else(|| Error::corrupt(source.origin(), format!("group {id} has no range {index}")))
}

fn decode<S: ColumnSource + ?Sized>(node: &Node, source: &S, index: usize) -> Result<Value> {
    match node {
        Node::Leaf(id) | Node::Label(id, _) => leaf_value(source, *id, index),
        Node::Sequence { group, item, inner } => {
            let items = group_range(source, *group, index)?
                .map(|i| decode(inner, source, i))
                .collect::<Result<Vec<_>>>()?;

            // Sequences of structs decode to the columnar form
            match item {
                FeatureSpec::Struct(fields) => {
                    let mut columns: Vec<(String, Vec<Value>)> = fields
                        .iter()
                        .map(|(name, _)| (name.clone(), Vec::with_capacity(items.len())))
                        .collect();
                    for element in items {
                        let Value::Map(mut entries) = element else {
                            return Err(Error::corrupt(source.origin(), "struct element did not decode to a map"));
                        };
                        for (name, column) in &mut columns {
                            column.push(entries.remove(name).unwrap_or(Value::Null));
                        }
                    }
                    Ok(Value::Map(
                        columns
                            .into_iter()
                            .map(|(name, column)| (name, Value::List(column)))
                            .collect(),
                    ))
                }
                _ => Ok(Value::List(items)),
            }
        }
        Node::Struct(fields) => fields
            .iter()
            .map(|(name, child)| Ok((name.clone(), decode(child, source, index)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Value::Map),
        Node::Translation(languages) => languages
            .iter()
            .map(|(language, id)| Ok((language.clone(), leaf_value(source, *id, index)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Value::Map),
        Node::VariableTranslation {
            group, language, text, ..
        } => {
            let pairs = group_range(source, *group, index)?
                .map(|i| {
                    let lang = leaf_value(source, *language, i)?;
                    let translation = leaf_value(source, *text, i)?;
                    match (lang, translation) {
                        (Value::Str(l), Value::Str(t)) => Ok((l, t)),
                        _ => Err(Error::corrupt(source.origin(), "translation entry is not a string pair")),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(TranslationVariableLanguages::from_pairs(pairs))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::example;
    use crate::features::{Field, Translation};
    use proptest::prelude::*;

    fn string() -> FeatureSpec {
        FeatureSpec::Scalar(ScalarKind::String)
    }

    fn nested() -> Features {
        Features::new(vec![
            Field::new("id", FeatureSpec::Scalar(ScalarKind::Int32)),
            Field::new(
                "a",
                FeatureSpec::sequence(FeatureSpec::structure([
                    ("b", string()),
                    ("c", FeatureSpec::sequence(FeatureSpec::Scalar(ScalarKind::Float64))),
                ])),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn traversal_order_is_deterministic() {
        let layout = PhysicalLayout::new(nested());
        let paths: Vec<_> = layout.leaves().iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["id", "a.b", "a.c"]);

        let groups: Vec<_> = layout.groups().iter().map(|g| (g.path.as_str(), g.parent)).collect();
        assert_eq!(groups, vec![("a[]", None), ("a.c[]", Some(0))]);

        assert_eq!(layout.leaves()[1].group, Some(0));
        assert_eq!(layout.leaves()[2].group, Some(1));
        assert_eq!(layout.fields()[1].leaves, 1..3);
    }

    #[test]
    fn sequence_of_struct_shares_one_offsets_group() {
        let features = Features::from_pairs([(
            "a",
            FeatureSpec::sequence(FeatureSpec::structure([("b", string()), ("c", string())])),
        )])
        .unwrap();
        let layout = PhysicalLayout::new(features);
        assert_eq!(layout.groups().len(), 1);
        assert!(layout.leaves().iter().all(|l| l.group == Some(0)));
    }

    #[test]
    fn list_of_maps_normalises_to_columnar_form() {
        let layout = Arc::new(PhysicalLayout::new(nested()));
        let mut batch = ColumnBatch::new(layout);
        let rows = Value::List(vec![
            Value::map([("b", Value::from("x")), ("c", Value::from(vec![1.0]))]),
            Value::map([("b", Value::from("y")), ("c", Value::from(Vec::<f64>::new()))]),
        ]);
        batch.push(&example! { "id" => 1, "a" => rows }).unwrap();

        let expected = Value::map([
            ("b", Value::from(vec!["x", "y"])),
            ("c", Value::List(vec![Value::from(vec![1.0]), Value::List(vec![])])),
        ]);
        assert_eq!(batch.row(0).unwrap()["a"], expected);
    }

    #[test]
    fn canonical_form_is_stable() {
        let features = Features::from_pairs([
            ("a", FeatureSpec::sequence(FeatureSpec::structure([("b", string())]))),
            (
                "variable",
                FeatureSpec::TranslationVariableLanguages(TranslationVariableLanguages::any()),
            ),
        ])
        .unwrap();
        let layout = Arc::new(PhysicalLayout::new(features));

        let mut first = ColumnBatch::new(Arc::clone(&layout));
        first
            .push(&example! {
                "a" => Value::List(vec![Value::map([("b", Value::from("x"))])]),
                "variable" => Value::map([("en", Value::from(vec!["dog"]))]),
            })
            .unwrap();
        let canonical = first.row(0).unwrap();
        assert_eq!(canonical["a"], Value::map([("b", Value::from(vec!["x"]))]));
        assert_eq!(canonical["variable"], Value::map([("en", Value::from("dog"))]));

        let mut second = ColumnBatch::new(layout);
        second.push(&canonical).unwrap();
        assert_eq!(second.row(0).unwrap(), canonical);
    }

    #[test]
    fn rejected_example_leaves_batch_untouched() {
        let layout = Arc::new(PhysicalLayout::new(nested()));
        let mut batch = ColumnBatch::new(layout);
        let bad = example! { "id" => 1, "a" => Value::map([("b", Value::from(vec!["x"]))]) };
        assert!(matches!(batch.push(&bad), Err(Error::SchemaMismatch { .. })));
        assert!(batch.is_empty());
        assert!(batch.leaf_buffers().iter().all(|l| l.is_empty()));
    }

    #[test]
    fn translations_round_trip() {
        let features = Features::from_pairs([
            ("fixed", FeatureSpec::Translation(Translation::new(["en", "fr"]))),
            (
                "variable",
                FeatureSpec::TranslationVariableLanguages(TranslationVariableLanguages::any()),
            ),
            ("label", FeatureSpec::ClassLabel(ClassLabel::new(["neg", "pos"]).unwrap())),
        ])
        .unwrap();
        let mut batch = ColumnBatch::new(Arc::new(PhysicalLayout::new(features)));

        let example = example! {
            "fixed" => Value::map([("en", Value::from("cat")), ("fr", Value::from("chat"))]),
            "variable" => Value::map([
                ("de", Value::from(vec!["Katze", "Kater"])),
                ("en", Value::from("cat")),
            ]),
            "label" => 1,
        };
        batch.push(&example).unwrap();
        batch.push(&example! {
            "fixed" => Value::map([("en", Value::from("dog")), ("fr", Value::from("chien"))]),
            "variable" => Value::map([("en", Value::from(vec!["dog"]))]),
            "label" => "neg",
        })
        .unwrap();

        assert_eq!(batch.row(0).unwrap(), example);
        let second = batch.row(1).unwrap();
        assert_eq!(second["variable"], Value::map([("en", Value::from("dog"))]));
        assert_eq!(second["label"], Value::Int(0));
    }

    fn scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![Just(Value::Null), "[a-z]{0,6}".prop_map(Value::from)]
    }

    proptest! {
        #[test]
        fn nested_values_round_trip(
            rows in prop::collection::vec(
                (any::<i64>(), prop::collection::vec(prop::collection::vec(scalar_value(), 0..4), 0..4)),
                0..12,
            )
        ) {
            let features = Features::from_pairs([
                ("key", FeatureSpec::Scalar(ScalarKind::Int64)),
                ("nested", FeatureSpec::sequence(FeatureSpec::sequence(string()))),
            ])
            .unwrap();
            let mut batch = ColumnBatch::new(Arc::new(PhysicalLayout::new(features)));

            let mut expected = Vec::new();
            for (key, nested) in rows {
                let nested: Vec<Value> = nested.into_iter().map(Value::List).collect();
                let ex = example! { "key" => key, "nested" => Value::List(nested) };
                batch.push(&ex).unwrap();
                expected.push(ex);
            }

            for (i, ex) in expected.iter().enumerate() {
                prop_assert_eq!(&batch.row(i).unwrap(), ex);
            }
        }
    }
}
