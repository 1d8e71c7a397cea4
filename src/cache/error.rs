//! Errors surfaced by the shared block cache.

use std::path::PathBuf;

use thiserror::Error;

use crate::fetch::FetchError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid range [{start}, {end}) for a resource of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    #[error("Fetch of bytes [{start}, {end}) failed: {source}")]
    Fetch {
        start: u64,
        end: u64,
        #[source]
        source: FetchError,
    },

    #[error("Storage I/O failed on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not lock blocks [{first_block}, {end_block}): {source}")]
    Lock {
        first_block: u64,
        end_block: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache files at {path} do not match this cache: {reason}")]
    Layout { path: PathBuf, reason: String },

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Background fetch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CacheError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn layout(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CacheError::Layout {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidRange { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
