//! Builder configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use ml_datasets_core::{GenerationBackend, WriterOptions};
use ml_datasets_parallel::{LocalBackendOptions, LocalParallelBackend};

use crate::error::{Error, Result};

/// Cache root override
pub const CACHE_DIR_ENV: &str = "ML_DATASETS_CACHE";
/// Backend selection; `local` is the only bundled backend
pub const BACKEND_ENV: &str = "ML_DATASETS_BACKEND";
/// Worker count of the local backend
pub const BACKEND_WORKERS_ENV: &str = "ML_DATASETS_BACKEND_WORKERS";

/// What to do when the dataset already exists in the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerateMode {
    /// Reuse a complete existing build
    #[default]
    ReuseDatasetIfExists,
    /// Acquire and generate again, replacing an existing build
    ForceRedownload,
}

/// Settings of a [`DatasetBuilder`](crate::DatasetBuilder)
#[derive(Clone)]
pub struct BuilderOptions {
    /// Root of the dataset cache
    pub cache_dir: PathBuf,

    /// Backend for distributed splits; building one without it fails with
    /// [`Error::MissingGenerationConfig`]
    pub backend: Option<Arc<dyn GenerationBackend>>,

    /// Reuse policy
    pub generate_mode: GenerateMode,

    /// Keep the splits that succeeded when others fail
    pub allow_partial_builds: bool,

    /// Shard writer settings
    pub writer: WriterOptions,

    /// Recompute shard digests whenever splits are opened
    pub verify_shards: bool,
}

impl fmt::Debug for BuilderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuilderOptions")
            .field("cache_dir", &self.cache_dir)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("generate_mode", &self.generate_mode)
            .field("allow_partial_builds", &self.allow_partial_builds)
            .field("writer", &self.writer)
            .field("verify_shards", &self.verify_shards)
            .finish()
    }
}

impl BuilderOptions {
    /// Options with defaults and no backend
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            backend: None,
            generate_mode: GenerateMode::default(),
            allow_partial_builds: false,
            writer: WriterOptions::default(),
            verify_shards: false,
        }
    }

    /// Use a generation backend for distributed splits
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Start a local thread-pool backend for distributed splits
    pub fn with_local_backend(self, options: LocalBackendOptions) -> Result<Self> {
        let backend = LocalParallelBackend::new(options)?;
        Ok(self.with_backend(Arc::new(backend)))
    }

    /// Set the reuse policy
    #[must_use]
    pub fn with_generate_mode(mut self, mode: GenerateMode) -> Self {
        self.generate_mode = mode;
        self
    }

    /// Read the options from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the options from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = match lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => lookup("HOME")
                .filter(|v| !v.is_empty())
                .map(|home| PathBuf::from(home).join(".cache").join("ml-datasets"))
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("neither {CACHE_DIR_ENV} nor HOME is set"))
                })?,
        };
        let mut options = Self::new(cache_dir);

        match lookup(BACKEND_ENV).as_deref().map(str::trim) {
            None | Some("") => {}
            Some("local") => {
                let num_workers = match lookup(BACKEND_WORKERS_ENV) {
                    Some(value) => value.trim().parse().map_err(|_| {
                        Error::InvalidConfig(format!("{BACKEND_WORKERS_ENV}={value:?} is not a worker count"))
                    })?,
                    None => LocalBackendOptions::default().num_workers,
                };
                options = options.with_local_backend(LocalBackendOptions { num_workers })?;
            }
            Some(other) => {
                return Err(Error::InvalidConfig(format!(
                    "unknown generation backend {other:?} in {BACKEND_ENV}"
                )))
            }
        }

        tracing::debug!(?options, "loaded builder options");
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn cache_dir_defaults_under_home() {
        let options = BuilderOptions::from_lookup(lookup(&[("HOME", "/home/ada")])).unwrap();
        assert_eq!(options.cache_dir, PathBuf::from("/home/ada/.cache/ml-datasets"));
        assert!(options.backend.is_none());
        assert_eq!(options.generate_mode, GenerateMode::ReuseDatasetIfExists);
        assert!(!options.allow_partial_builds);
    }

    #[test]
    fn environment_selects_local_backend() {
        let options = BuilderOptions::from_lookup(lookup(&[
            (CACHE_DIR_ENV, "/data/cache"),
            (BACKEND_ENV, "local"),
            (BACKEND_WORKERS_ENV, "2"),
        ]))
        .unwrap();
        assert_eq!(options.cache_dir, PathBuf::from("/data/cache"));
        assert_eq!(options.backend.as_ref().map(|b| b.name()), Some("local"));
    }

    #[test]
    fn invalid_environment_is_rejected() {
        let cases: [&[(&str, &str)]; 4] = [
            &[],
            &[("HOME", "/h"), (BACKEND_ENV, "spark")],
            &[("HOME", "/h"), (BACKEND_ENV, "local"), (BACKEND_WORKERS_ENV, "many")],
            &[("HOME", "/h"), (BACKEND_ENV, "local"), (BACKEND_WORKERS_ENV, "0")],
        ];
        for vars in cases {
            assert!(BuilderOptions::from_lookup(lookup(vars)).is_err(), "{vars:?}");
        }
    }
}
