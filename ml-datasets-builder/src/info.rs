//! Dataset metadata persisted next to the built splits

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ml_datasets_core::io::{read_json, write_json_atomic};
use ml_datasets_core::Features;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::splits::SplitRegistry;

/// File holding the [`DatasetInfo`] of a built dataset
pub const DATASET_INFO_FILENAME: &str = "dataset_info.json";

/// `MAJOR.MINOR.PATCH` dataset version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Incompatible changes
    pub major: u32,
    /// Compatible additions
    pub minor: u32,
    /// Fixes
    pub patch: u32,
}

impl Version {
    /// Create a version
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid version {s:?}, expected MAJOR.MINOR.PATCH"));
        let parts = s
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;
        match parts.as_slice() {
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Version {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// Named variant of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Config name, a path segment of the cache directory
    pub name: String,

    /// Config version
    pub version: Version,

    /// Free-form description
    pub description: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            version: Version::default(),
            description: String::new(),
        }
    }
}

/// Input and target columns for supervised training
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisedKeys {
    /// Input column
    pub input: String,
    /// Target column
    pub output: String,
}

/// Size and checksum of one acquired file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChecksum {
    /// File size in bytes
    pub num_bytes: u64,
    /// Hex blake3 digest of the content
    pub checksum: String,
}

/// Descriptive and structural metadata of a dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Free-form description
    pub description: String,
    /// Citation text
    pub citation: String,
    /// Project homepage
    pub homepage: String,
    /// Data license
    pub license: String,
    /// Schema of every split
    pub features: Features,
    /// Default columns for supervised training
    pub supervised_keys: Option<SupervisedKeys>,

    /// Snake-case builder name
    pub builder_name: String,
    /// Config name
    pub config_name: String,
    /// Dataset version
    pub version: Version,

    /// Built splits; when declared by a script, the expected splits
    pub splits: SplitRegistry,

    /// Acquired files by location; when declared by a script, the expected
    /// checksums
    pub download_checksums: BTreeMap<String, DownloadChecksum>,
    /// Total bytes acquired
    pub download_size: u64,
    /// Total bytes of the split shards
    pub dataset_size: u64,
    /// `download_size + dataset_size`
    pub size_in_bytes: u64,

    /// Identity of the generation inputs (builder, config, version, schema,
    /// split names)
    pub generation_fingerprint: String,
}

impl DatasetInfo {
    /// Info with the given schema and empty descriptive fields
    pub fn new(features: Features) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    /// Recompute the size fields from the splits and downloads
    pub fn update_sizes(&mut self) {
        self.download_size = self.download_checksums.values().map(|c| c.num_bytes).sum();
        self.dataset_size = self.splits.total_num_bytes();
        self.size_in_bytes = self.download_size + self.dataset_size;
    }

    /// Persist as `dataset_info.json` inside `dir`
    pub fn write_to_directory(&self, dir: &Path) -> Result<()> {
        write_json_atomic(&dir.join(DATASET_INFO_FILENAME), self)?;
        Ok(())
    }

    /// Load `dataset_info.json` from `dir`
    pub fn from_directory(dir: &Path) -> Result<Self> {
        Ok(read_json(&dir.join(DATASET_INFO_FILENAME))?)
    }
}
