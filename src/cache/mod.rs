//! Shared, memory-mapped block cache.
//!
//! This module contains the cache and the pieces it is built from:
//! - [`range`]: block geometry, outward rounding, missing-run coalescing
//! - [`blockmap`]: persistent bitmap of present blocks in the index file
//! - [`store`]: fixed-length memory-mapped backing file
//! - [`lock`]: cross-process init and byte-range locks
//! - [`pending`]: in-process registry of runs being fetched
//! - [`shared`]: [`SharedBlockCache`], tying it all together

pub mod blockmap;
pub mod error;
pub mod lock;
pub mod pending;
pub mod range;
pub mod shared;
pub mod store;

pub use error::CacheError;
pub use shared::{CacheStats, SharedBlockCache};
