//! Engine configuration with builder and JSON file loading
use cachestorage_core::{
    Error, Result, DEFAULT_BODY_CHUNK_SIZE, DEFAULT_QUOTA_BYTES, MAX_QUERY_RESULT_BYTES,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which entry-store family backs newly created caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Persistent, one directory per cache under the origin root
    #[default]
    Disk,
    /// Ephemeral, lost when the process exits
    Memory,
}

/// Configuration for a cache storage context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStorageConfig {
    /// Root directory; each origin gets a subdirectory
    pub root_dir: PathBuf,
    /// Backend used for every origin in this context
    pub backend: BackendKind,
    /// Cap on the estimated size of one query's results
    pub max_query_result_bytes: u64,
    /// Chunk size for streaming bodies into entries
    pub body_chunk_size: usize,
    /// Quota granted to each origin by the built-in quota manager
    pub default_quota_bytes: u64,
}

impl Default for CacheStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("cachestorage"),
            backend: BackendKind::Disk,
            max_query_result_bytes: MAX_QUERY_RESULT_BYTES,
            body_chunk_size: DEFAULT_BODY_CHUNK_SIZE,
            default_quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

impl CacheStorageConfig {
    /// Start a builder from the defaults
    pub fn builder() -> CacheStorageConfigBuilder {
        CacheStorageConfigBuilder::new()
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io(path, "read config file", e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::invalid_argument("config", format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.body_chunk_size == 0 {
            return Err(Error::invalid_argument(
                "config",
                "body_chunk_size must be greater than zero",
            ));
        }
        if self.max_query_result_bytes == 0 {
            return Err(Error::invalid_argument(
                "config",
                "max_query_result_bytes must be greater than zero",
            ));
        }
        if self.backend == BackendKind::Disk && self.root_dir.as_os_str().is_empty() {
            return Err(Error::invalid_argument(
                "config",
                "root_dir is required for the disk backend",
            ));
        }
        Ok(())
    }
}

/// Builder for creating cache storage configurations
pub struct CacheStorageConfigBuilder {
    config: CacheStorageConfig,
}

impl CacheStorageConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheStorageConfig::default(),
        }
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.config.root_dir = root_dir.into();
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn with_max_query_result_bytes(mut self, bytes: u64) -> Self {
        self.config.max_query_result_bytes = bytes;
        self
    }

    pub fn with_body_chunk_size(mut self, bytes: usize) -> Self {
        self.config.body_chunk_size = bytes;
        self
    }

    pub fn with_default_quota_bytes(mut self, bytes: u64) -> Self {
        self.config.default_quota_bytes = bytes;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<CacheStorageConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CacheStorageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
