//! Split bookkeeping: which shards make up each named split

use std::cmp::Ordering;
use std::collections::BTreeMap;

use ml_datasets_core::{PartitionResult, ShardFileInfo};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Conventional split names
pub mod names {
    /// Training split
    pub const TRAIN: &str = "train";
    /// Validation split
    pub const VALIDATION: &str = "validation";
    /// Test split
    pub const TEST: &str = "test";
}

/// Size and content of one built split
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    /// Split name
    pub name: String,

    /// Rows over all shards
    pub num_examples: u64,

    /// Bytes over all shards
    pub num_bytes: u64,

    /// Shards in row order
    pub shards: Vec<ShardFileInfo>,

    /// Hex blake3 digest over the ordered shard digests
    pub checksum: String,
}

impl SplitInfo {
    /// Empty split
    pub fn new(name: impl Into<String>) -> Self {
        let mut info = Self {
            name: name.into(),
            ..Self::default()
        };
        info.refresh();
        info
    }

    /// Split made of the given shards, in order
    pub fn from_shards(name: impl Into<String>, shards: Vec<ShardFileInfo>) -> Self {
        let mut info = Self::new(name);
        info.shards = shards;
        info.refresh();
        info
    }

    /// Number of shard files
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Add the output of one generation partition.
    ///
    /// Shards are ordered by the numbers embedded in their names (partition
    /// index, then shard index), so the merged shard list does not depend on
    /// the order in which partitions are merged.
    pub fn merge_partition(&mut self, partition: PartitionResult) {
        self.shards.extend(partition.shards);
        self.sort_shards();
        self.refresh();
    }

    /// Merge another partial view of the same split
    pub fn merge(&mut self, other: SplitInfo) {
        self.shards.extend(other.shards);
        self.sort_shards();
        self.refresh();
    }

    fn sort_shards(&mut self) {
        self.shards
            .sort_by(|a, b| compare_shard_names(&a.file_name, &b.file_name));
    }

    fn refresh(&mut self) {
        self.num_examples = self.shards.iter().map(|s| s.num_rows).sum();
        self.num_bytes = self.shards.iter().map(|s| s.num_bytes).sum();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ml-datasets/split/v1");
        for shard in &self.shards {
            hasher.update(shard.digest.as_bytes());
        }
        self.checksum = hasher.finalize().to_hex().to_string();
    }
}

/// Orders names chunk by chunk, comparing digit runs by numeric value so
/// that `x-99999` sorts before `x-100000`.
fn compare_shard_names(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (da, ra) = split_digits(a);
                let (db, rb) = split_digits(b);
                let (ta, tb) = (trim_zeros(da), trim_zeros(db));
                let ordering = ta
                    .len()
                    .cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    .then_with(|| da.len().cmp(&db.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
                (a, b) = (ra, rb);
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                (a, b) = (&a[1..], &b[1..]);
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|c| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().position(|&c| c != b'0').unwrap_or(digits.len());
    &digits[start..]
}

/// Built splits by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SplitRegistry {
    splits: BTreeMap<String, SplitInfo>,
}

impl SplitRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a split
    pub fn add(&mut self, info: SplitInfo) {
        self.splits.insert(info.name.clone(), info);
    }

    /// Look up a split
    pub fn get(&self, name: &str) -> Option<&SplitInfo> {
        self.splits.get(name)
    }

    /// Look up a split, failing with the available names
    pub fn require(&self, name: &str) -> Result<&SplitInfo> {
        self.get(name).ok_or_else(|| Error::SplitExpression {
            expression: name.to_string(),
            reason: format!("unknown split; available: {:?}", self.names()),
        })
    }

    /// Split names in order
    pub fn names(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    /// Splits in name order
    pub fn iter(&self) -> impl Iterator<Item = &SplitInfo> {
        self.splits.values()
    }

    /// Number of splits
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    /// Whether there are no splits
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Rows over all splits
    pub fn total_num_examples(&self) -> u64 {
        self.iter().map(|s| s.num_examples).sum()
    }

    /// Bytes over all splits
    pub fn total_num_bytes(&self) -> u64 {
        self.iter().map(|s| s.num_bytes).sum()
    }

    /// Whether both registries have the same split names and example counts
    pub fn same_sizes(&self, other: &SplitRegistry) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|s| other.get(&s.name).is_some_and(|o| o.num_examples == s.num_examples))
    }

    /// Check built splits against declared ones. Splits listed in `skipped`
    /// are not required to be present.
    pub fn verify(&self, expected: &SplitRegistry, skipped: &[String]) -> Result<()> {
        let unexpected: Vec<String> = self
            .names()
            .into_iter()
            .filter(|name| expected.get(name).is_none())
            .map(str::to_string)
            .collect();
        if !unexpected.is_empty() {
            return Err(Error::UnexpectedSplits(unexpected));
        }

        let missing: Vec<String> = expected
            .names()
            .into_iter()
            .filter(|name| self.get(name).is_none() && !skipped.iter().any(|s| s == name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(Error::ExpectedMoreSplits(missing));
        }

        for built in self.iter() {
            if let Some(declared) = expected.get(&built.name) {
                if declared.num_examples != built.num_examples {
                    return Err(Error::NonMatchingSplitSizes {
                        split: built.name.clone(),
                        expected: declared.num_examples,
                        found: built.num_examples,
                    });
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a SplitRegistry {
    type Item = &'a SplitInfo;
    type IntoIter = std::collections::btree_map::Values<'a, String, SplitInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.splits.values()
    }
}

impl FromIterator<SplitInfo> for SplitRegistry {
    fn from_iter<I: IntoIterator<Item = SplitInfo>>(iter: I) -> Self {
        let mut registry = Self::new();
        for info in iter {
            registry.add(info);
        }
        registry
    }
}
