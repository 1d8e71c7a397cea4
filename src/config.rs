//! Runtime configuration for smmap-cache.
//!
//! A cache is described by the resource geometry (total size, block size)
//! and the two file paths every sharing process must agree on. The knobs
//! can be loaded from a JSON file or constructed programmatically.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;

/// Default bytes per cache block (2 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Cache directory used when neither the CLI nor the config file names one.
pub const DEFAULT_CACHE_DIR: &str = ".smmap-cache";

/// File name of the backing store inside a cache directory.
pub const DATA_FILE_NAME: &str = "cache";

/// File name of the blockmap index inside a cache directory.
pub const INDEX_FILE_NAME: &str = "cache-index";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "smmap-cache",
    version,
    about = "Read byte ranges of a local or remote file through a shared mmap cache"
)]
pub struct Cli {
    /// Path to a configuration file (JSON) with cache defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Read `[start, end)` of SOURCE through the cache.
    Read {
        /// Local path or http(s) URL.
        source: String,

        /// First byte to read.
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// One past the last byte to read (defaults to the end of the source).
        #[arg(long)]
        end: Option<u64>,

        /// Write the bytes here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print cache counters to stderr when done.
        #[arg(long)]
        metrics: bool,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Fill the cache with the whole of SOURCE.
    Prefetch {
        /// Local path or http(s) URL.
        source: String,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Show how much of a cache directory is filled.
    Status {
        /// Cache directory to inspect.
        #[arg(long, default_value = DEFAULT_CACHE_DIR)]
        cache_dir: PathBuf,
    },
}

/// Where the cache lives and how it is blocked.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Directory holding the backing file and its index (overrides the
    /// config file's locations).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Bytes per cache block (overrides the config file).
    #[arg(long)]
    pub block_size: Option<u64>,
}

impl CacheArgs {
    /// Combine file defaults with these arguments for a resource of `total_size` bytes.
    pub fn resolve(&self, defaults: &CacheConfig, total_size: u64) -> CacheConfig {
        let mut config = match &self.cache_dir {
            Some(dir) => CacheConfig::in_dir(dir, total_size),
            None => CacheConfig {
                total_size,
                ..defaults.clone()
            },
        };
        config.block_size = self.block_size.unwrap_or(defaults.block_size);
        config.sync_writes = defaults.sync_writes;
        config
    }
}

/// Configuration of one shared block cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total length of the cached resource in bytes.
    pub total_size: u64,

    /// Bytes per block: the unit of fetching and of presence tracking.
    pub block_size: u64,

    /// Path of the backing file (exactly `total_size` bytes).
    pub location: PathBuf,

    /// Path of the index file holding the blockmap and the range locks.
    pub index_location: PathBuf,

    /// msync written ranges before marking them present.
    pub sync_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_size: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            location: Path::new(DEFAULT_CACHE_DIR).join(DATA_FILE_NAME),
            index_location: Path::new(DEFAULT_CACHE_DIR).join(INDEX_FILE_NAME),
            sync_writes: false,
        }
    }
}

impl CacheConfig {
    pub fn new(
        total_size: u64,
        location: impl Into<PathBuf>,
        index_location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            total_size,
            location: location.into(),
            index_location: index_location.into(),
            ..Default::default()
        }
    }

    /// A cache stored as `<dir>/cache` and `<dir>/cache-index`.
    pub fn in_dir(dir: impl AsRef<Path>, total_size: u64) -> Self {
        let dir = dir.as_ref();
        Self::new(
            total_size,
            dir.join(DATA_FILE_NAME),
            dir.join(INDEX_FILE_NAME),
        )
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CacheConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CacheConfig::default())
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.block_size == 0 {
            return Err(CacheError::InvalidConfig(
                "block_size must be greater than zero".to_string(),
            ));
        }
        if self.location == self.index_location {
            return Err(CacheError::InvalidConfig(format!(
                "backing file and index file must differ (both {})",
                self.location.display()
            )));
        }
        Ok(())
    }
}
