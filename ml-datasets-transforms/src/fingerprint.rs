//! Content fingerprints for transformation results
//!
//! A fingerprint identifies the output of one operation: the identity of the
//! input table (schema, shard content digests, row view), the operation name,
//! its arguments and the identity of any user function involved. Two
//! computations with the same fingerprint are treated as interchangeable.

use std::fmt;
use std::str::FromStr;

use ml_datasets_core::Table;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 32-byte blake3 digest identifying a transformation result
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full 64-character hex form
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// 32-character hex prefix used for cache directory names
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(32);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        blake3::Hash::from_hex(s)
            .map(|hash| Fingerprint(*hash.as_bytes()))
            .map_err(|err| Error::InvalidArgument(format!("invalid fingerprint {s}: {err}")))
    }
}

/// Stable identity of a user-supplied function.
///
/// Functions cannot be fingerprinted from their code, so every function used
/// in a cached operation carries an explicit name and version. Bump the
/// version whenever the function's behaviour changes, or the cache will keep
/// returning results computed by the old behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// Name unique among the caller's functions
    pub name: String,

    /// Behaviour version
    pub version: u32,
}

impl FunctionId {
    /// Create a function identity
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Incrementally derives a [`Fingerprint`]
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    /// Start a fingerprint for an operation
    pub fn new(operation: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(format!("ml-datasets/{operation}/v1").as_bytes());
        Self { hasher }
    }

    fn tagged(&mut self, tag: &str, bytes: &[u8]) {
        self.hasher.update(&(tag.len() as u64).to_le_bytes());
        self.hasher.update(tag.as_bytes());
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }

    /// Include the identity of an input table
    pub fn table(mut self, table: &Table) -> Result<Self> {
        self.hasher.update(b"table");
        table.fingerprint_material(&mut self.hasher)?;
        Ok(self)
    }

    /// Include the identity of a user function
    pub fn function(mut self, function: &FunctionId) -> Self {
        self.tagged("function.name", function.name.as_bytes());
        self.tagged("function.version", &function.version.to_le_bytes());
        self
    }

    /// Include a named argument in its canonical binary form
    pub fn arg<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        let encoded = bincode::serialize(value)?;
        self.tagged(name, &encoded);
        Ok(self)
    }

    /// Finish the fingerprint
    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}
