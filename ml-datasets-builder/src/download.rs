//! Raw-data acquisition collaborator
//!
//! Network transfer and archive extraction live outside this crate. The
//! builder only talks to a [`DownloadManager`]; the bundled
//! [`LocalDownloadManager`] serves local files and records their checksums.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::AcquisitionError;
use crate::info::DownloadChecksum;

/// Fetches raw data for dataset scripts
#[cfg_attr(test, mockall::automock)]
pub trait DownloadManager: Send + Sync {
    /// Make each location available locally and return the local paths, in
    /// the order of `urls`
    fn download_and_extract(&self, urls: &[String]) -> Result<Vec<PathBuf>, AcquisitionError>;

    /// Size and checksum of every file acquired so far
    fn recorded_checksums(&self) -> BTreeMap<String, DownloadChecksum>;
}

/// Serves local paths and `file://` URLs; remote schemes are unreachable
#[derive(Debug, Default)]
pub struct LocalDownloadManager {
    base_dir: Option<PathBuf>,
    checksums: Mutex<BTreeMap<String, DownloadChecksum>>,
}

impl LocalDownloadManager {
    /// Resolve relative paths against the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            ..Self::default()
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, AcquisitionError> {
        let location = match url.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, _)) => {
                return Err(AcquisitionError::Unreachable {
                    url: url.to_string(),
                    reason: format!("{scheme} sources are not served by the local download manager"),
                })
            }
            None => url,
        };
        let path = Path::new(location);
        let path = match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };
        if !path.exists() {
            return Err(AcquisitionError::Unreachable {
                url: url.to_string(),
                reason: format!("{} does not exist", path.display()),
            });
        }
        Ok(path)
    }

    fn record(&self, url: &str, path: &Path) -> Result<(), AcquisitionError> {
        if !path.is_file() {
            return Ok(());
        }
        let checksum = file_checksum(path).map_err(|source| AcquisitionError::Io {
            url: url.to_string(),
            source,
        })?;
        tracing::debug!(url, bytes = checksum.num_bytes, "recorded checksum");
        self.checksums
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(url.to_string(), checksum);
        Ok(())
    }
}

impl DownloadManager for LocalDownloadManager {
    fn download_and_extract(&self, urls: &[String]) -> Result<Vec<PathBuf>, AcquisitionError> {
        urls.iter()
            .map(|url| {
                let path = self.resolve(url)?;
                self.record(url, &path)?;
                Ok(path)
            })
            .collect()
    }

    fn recorded_checksums(&self) -> BTreeMap<String, DownloadChecksum> {
        self.checksums
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Size and blake3 digest of a file, read in 64 KiB blocks
pub fn file_checksum(path: &Path) -> io::Result<DownloadChecksum> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut num_bytes = 0u64;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        num_bytes += read as u64;
    }
    Ok(DownloadChecksum {
        num_bytes,
        checksum: hasher.finalize().to_hex().to_string(),
    })
}

/// Compare recorded checksums with declared ones. Locations that were
/// declared but not acquired are not checked.
pub fn verify_checksums(
    expected: &BTreeMap<String, DownloadChecksum>,
    recorded: &BTreeMap<String, DownloadChecksum>,
) -> Result<(), AcquisitionError> {
    for (url, declared) in expected {
        let Some(found) = recorded.get(url) else {
            continue;
        };
        if found != declared {
            return Err(AcquisitionError::ChecksumMismatch {
                url: url.clone(),
                expected: format!("{} ({} bytes)", declared.checksum, declared.num_bytes),
                found: format!("{} ({} bytes)", found.checksum, found.num_bytes),
            });
        }
    }
    Ok(())
}
