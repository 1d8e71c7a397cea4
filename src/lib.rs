//! smmap-cache: a byte-range cache for remote files, shared across processes.
//!
//! Callers ask for any `[start, end)` range of a resource of known size. The
//! cache answers from a memory-mapped backing file, fetching only the
//! block-aligned runs that no process has filled yet. Several independent
//! processes can open the same cache files at once: a blockmap in a side
//! index file records which blocks are present, and advisory byte-range
//! locks on that file make sure each block is fetched at most once.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod reader;

pub use cache::{CacheError, CacheStats, SharedBlockCache};
pub use config::CacheConfig;
pub use fetch::{FetchError, Fetcher};
pub use reader::{BlockCache, CachedFile, Uncached};
