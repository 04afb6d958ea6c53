//! Fingerprint-keyed cache of materialized transformation results
//!
//! Each entry is a directory `<cache_dir>/<fingerprint>/` holding shard files
//! and a `manifest.json`. Entries are built in a hidden staging directory and
//! renamed into place, so a visible entry is always complete. Within one
//! process a mutex keyed by cache directory and fingerprint, shared by every
//! [`FingerprintCache`] instance, guarantees that a computation runs at most
//! once; across processes the atomic rename decides which copy survives and
//! the loser adopts it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use ml_datasets_core::io::{read_json, staging_path, write_json_atomic, StagedPath};
use ml_datasets_core::shard::shard_paths;
use ml_datasets_core::{Features, ShardFileInfo, Table};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

const MANIFEST: &str = "manifest.json";

type EntryKey = (PathBuf, Fingerprint);

/// Entry locks of every cache in the process. Unused locks are dropped and
/// their keys pruned on the next insertion.
static ENTRY_LOCKS: OnceLock<Mutex<HashMap<EntryKey, Weak<Mutex<()>>>>> = OnceLock::new();

/// Shards produced by a computation, before they are published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Schema of the produced shards
    pub features: Features,

    /// Shards in row order
    pub shards: Vec<ShardFileInfo>,
}

/// Metadata of one cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Full hex fingerprint
    pub fingerprint: String,

    /// Operation that produced the entry
    pub operation: String,

    /// Schema of the shards
    pub features: Features,

    /// Total rows
    pub num_rows: u64,

    /// Shards in row order
    pub shards: Vec<ShardFileInfo>,
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from an existing entry
    pub hits: u64,

    /// Lookups that required a computation
    pub misses: u64,

    /// Entries published by this cache instance
    pub stores: u64,
}

/// Content-addressed store of transformation outputs
#[derive(Debug)]
pub struct FingerprintCache {
    dir: PathBuf,
    lock_root: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl FingerprintCache {
    /// Open a cache rooted at `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock_root = fs::canonicalize(&dir)?;
        Ok(Self {
            dir,
            lock_root,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        })
    }

    /// Cache root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of the entry for a fingerprint
    pub fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.short())
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
        }
    }

    fn lock_for(&self, fingerprint: Fingerprint) -> Result<Arc<Mutex<()>>> {
        let registry = ENTRY_LOCKS.get_or_init(Mutex::default);
        let mut locks = registry.lock().map_err(|_| Error::LockPoisoned)?;
        let key = (self.lock_root.clone(), fingerprint);
        if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(key, Arc::downgrade(&lock));
        Ok(lock)
    }

    fn open_entry(&self, dir: &Path) -> Result<Option<Table>> {
        let manifest_path = dir.join(MANIFEST);
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let manifest: CacheManifest = read_json(&manifest_path).map_err(|err| Error::InvalidCacheEntry {
            path: dir.to_path_buf(),
            reason: err.to_string(),
        })?;
        let table = Table::open(&manifest.features, &shard_paths(dir, &manifest.shards))?;
        Ok(Some(table))
    }

    /// Return the cached table for a fingerprint, if present
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Table>> {
        self.open_entry(&self.entry_dir(fingerprint))
    }

    /// Return the cached table for `fingerprint`, computing and storing it on a
    /// miss. `compute` writes its shards into the directory it is given.
    ///
    /// A failed computation leaves no entry behind and its error is returned
    /// unchanged.
    pub fn get_or_compute<F>(&self, fingerprint: Fingerprint, operation: &str, compute: F) -> Result<Table>
    where
        F: FnOnce(&Path) -> Result<Materialized>,
    {
        let lock = self.lock_for(fingerprint)?;
        let _guard = lock.lock().map_err(|_| Error::LockPoisoned)?;

        if let Some(table) = self.lookup(&fingerprint)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%fingerprint, operation, "cache hit");
            return Ok(table);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%fingerprint, operation, "cache miss");

        let target = self.entry_dir(&fingerprint);
        let mut staged = StagedPath::new(staging_path(&target));
        fs::create_dir_all(staged.path())?;

        let output = compute(staged.path())?;
        let manifest = CacheManifest {
            fingerprint: fingerprint.to_hex(),
            operation: operation.to_string(),
            features: output.features,
            num_rows: output.shards.iter().map(|s| s.num_rows).sum(),
            shards: output.shards,
        };
        write_json_atomic(&staged.path().join(MANIFEST), &manifest)?;

        match fs::rename(staged.path(), &target) {
            Ok(()) => {
                staged.disarm();
                self.stores.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    %fingerprint,
                    operation,
                    rows = manifest.num_rows,
                    shards = manifest.shards.len(),
                    "stored cache entry"
                );
            }
            Err(err) if target.join(MANIFEST).is_file() => {
                // Another process published the same fingerprint first
                tracing::debug!(%fingerprint, error = %err, "adopting concurrently stored entry");
            }
            Err(err) => return Err(err.into()),
        }
        drop(staged);

        self.open_entry(&target)?.ok_or_else(|| Error::InvalidCacheEntry {
            path: target,
            reason: "entry vanished after publication".into(),
        })
    }

    /// Remove every entry except those backing the given tables. Returns the
    /// number of removed directories.
    pub fn cleanup_cache_files(&self, keep: &[&Table]) -> Result<usize> {
        let kept: HashSet<PathBuf> = keep
            .iter()
            .flat_map(|table| table.shard_paths())
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || kept.contains(&path) {
                continue;
            }
            fs::remove_dir_all(&path)?;
            removed += 1;
        }
        tracing::info!(dir = %self.dir.display(), removed, "cleaned up cache files");
        Ok(removed)
    }

    /// Remove the whole content of the cache directory
    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::fingerprint::FingerprintBuilder;
    use ml_datasets_core::{example, FeatureSpec, ScalarKind, ShardWriter, WriterOptions};
    use tempfile::tempdir;

    fn features() -> Features {
        Features::from_pairs([("n", FeatureSpec::Scalar(ScalarKind::Int64))]).unwrap()
    }

    fn write_numbers(dir: &Path, count: i64) -> Result<Materialized> {
        let mut writer = ShardWriter::new(dir, "data", features(), WriterOptions::default())?;
        writer.write_all((0..count).map(|n| example! { "n" => n }))?;
        let summary = writer.finish()?;
        Ok(Materialized {
            features: features(),
            shards: summary.shards,
        })
    }

    #[test]
    fn computes_once_then_hits() {
        let dir = tempdir().unwrap();
        let cache = FingerprintCache::new(dir.path()).unwrap();
        let fp = FingerprintBuilder::new("numbers").finish();

        let first = cache.get_or_compute(fp, "numbers", |d| write_numbers(d, 4)).unwrap();
        let second = cache
            .get_or_compute(fp, "numbers", |_| panic!("must not recompute"))
            .unwrap();

        assert_eq!(first.num_rows(), 4);
        assert_eq!(second.row(3).unwrap(), first.row(3).unwrap());
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, stores: 1 });
        assert!(cache.entry_dir(&fp).join(MANIFEST).is_file());
    }

    #[test]
    fn failed_computation_leaves_no_entry() {
        let dir = tempdir().unwrap();
        let cache = FingerprintCache::new(dir.path()).unwrap();
        let fp = FingerprintBuilder::new("broken").finish();

        let err = cache
            .get_or_compute(fp, "broken", |_| Err(Error::InvalidArgument("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(cache.lookup(&fp).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn concurrent_callers_share_one_computation() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FingerprintCache::new(dir.path()).unwrap());
        let fp = FingerprintBuilder::new("shared").finish();
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    cache
                        .get_or_compute(fp, "shared", |d| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            write_numbers(d, 10)
                        })
                        .unwrap()
                        .num_rows()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 10);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn instances_on_one_directory_share_computations() {
        let dir = tempdir().unwrap();
        let fp = FingerprintBuilder::new("two-instances").finish();
        let runs = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = FingerprintCache::new(dir.path()).unwrap();
                let runs = Arc::clone(&runs);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    cache
                        .get_or_compute(fp, "two-instances", |d| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            write_numbers(d, 5)
                        })
                        .unwrap()
                        .num_rows()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn released_locks_are_pruned() {
        let dir = tempdir().unwrap();
        let cache = FingerprintCache::new(dir.path()).unwrap();
        for i in 0..16 {
            let fp = FingerprintBuilder::new("pruned").arg("i", &i).unwrap().finish();
            cache.get_or_compute(fp, "pruned", |d| write_numbers(d, 1)).unwrap();
        }

        let registry = ENTRY_LOCKS.get().unwrap().lock().unwrap();
        let live = registry
            .keys()
            .filter(|(root, _)| root == &cache.lock_root)
            .count();
        assert!(live <= 1, "{live} locks kept for released entries");
    }

    #[test]
    fn cleanup_keeps_referenced_entries() {
        let dir = tempdir().unwrap();
        let cache = FingerprintCache::new(dir.path()).unwrap();
        let keep = cache
            .get_or_compute(FingerprintBuilder::new("a").finish(), "a", |d| write_numbers(d, 1))
            .unwrap();
        cache
            .get_or_compute(FingerprintBuilder::new("b").finish(), "b", |d| write_numbers(d, 2))
            .unwrap();

        assert_eq!(cache.cleanup_cache_files(&[&keep]).unwrap(), 1);
        assert_eq!(keep.num_rows(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        cache.clear().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
