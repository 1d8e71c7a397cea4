//! The shared block cache.
//!
//! [`SharedBlockCache`] serves arbitrary byte ranges of one resource out of
//! a memory-mapped backing file, fetching only the blocks nobody has filled
//! yet. Any number of processes may open the same pair of files; they
//! coordinate solely through the files themselves:
//!
//! 1. unlocked fast path: if every block under the request is marked in the
//!    blockmap, the bytes are returned straight from the mapping;
//! 2. otherwise the missing blocks are grouped into contiguous runs and each
//!    run is claimed in-process, then locked across processes;
//! 3. under the lock the blockmap is read again and only the blocks still
//!    missing are fetched, written to the mapping, and then marked present.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::blockmap::{open_shared_file, Blockmap, IndexInfo};
use crate::cache::error::CacheError;
use crate::cache::lock::{InitLock, RangeLocker};
use crate::cache::pending::PendingFetches;
use crate::cache::range::{BlockGeometry, BlockSpan};
use crate::cache::store::BackingStore;
use crate::config::CacheConfig;
use crate::fetch::{fetch_exact, Fetcher};
use crate::metrics::CacheMetrics;

/// Point-in-time fill statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub present_blocks: u64,
}

/// A fixed-size, fill-only byte-range cache shared across processes.
pub struct SharedBlockCache {
    config: CacheConfig,
    geometry: BlockGeometry,
    blockmap: Blockmap,
    store: BackingStore,
    locker: RangeLocker,
    pending: PendingFetches,
    fetcher: Box<dyn Fetcher>,
    metrics: CacheMetrics,
}

impl SharedBlockCache {
    /// Open the cache described by `config`, creating its files if needed.
    pub fn open<F>(config: CacheConfig, fetcher: F) -> Result<Self, CacheError>
    where
        F: Fetcher + 'static,
    {
        Self::open_boxed(config, Box::new(fetcher))
    }

    pub fn open_boxed(config: CacheConfig, fetcher: Box<dyn Fetcher>) -> Result<Self, CacheError> {
        config.validate()?;
        let geometry = BlockGeometry::new(config.total_size, config.block_size);

        let index_file = open_shared_file(&config.index_location)?;
        let init = InitLock::acquire(&index_file)
            .map_err(|e| CacheError::storage(&config.index_location, e))?;

        let blockmap = Blockmap::load_or_create(&config.index_location, &index_file, geometry)?;
        // Bits already set vouch for bytes that must still be on disk.
        let has_cached_blocks = blockmap.present_count() > 0;
        let store = BackingStore::open(&config.location, geometry.total_size(), has_cached_blocks)?;
        drop(init);

        let locker = RangeLocker::new(&config.index_location, index_file);
        let metrics = CacheMetrics::new()?;

        info!(
            location = %config.location.display(),
            index = %config.index_location.display(),
            total_size = geometry.total_size(),
            block_size = geometry.block_size(),
            present = blockmap.present_count(),
            blocks = geometry.block_count(),
            "Opened shared block cache"
        );

        Ok(Self {
            config,
            geometry,
            blockmap,
            store,
            locker,
            pending: PendingFetches::new(),
            fetcher,
            metrics,
        })
    }

    /// Summarize the index file at `index_location` without opening the cache.
    pub fn inspect(index_location: &std::path::Path) -> Result<IndexInfo, CacheError> {
        Blockmap::inspect(index_location)
    }

    /// Return the bytes `[start, end)`, fetching whatever blocks are missing.
    ///
    /// Blocks until any fetch of overlapping blocks, in this or another
    /// process, has finished. On a fetch failure, runs completed earlier in
    /// the same call stay cached.
    pub fn fetch_range(&self, start: u64, end: u64) -> Result<&[u8], CacheError> {
        let size = self.geometry.total_size();
        if start > end || end > size {
            return Err(CacheError::InvalidRange { start, end, size });
        }
        if start == end {
            return Ok(&[]);
        }
        self.metrics.requests.inc();

        let span = self.geometry.span_for(start, end);
        let runs = self.blockmap.missing_runs(span);
        if runs.is_empty() {
            self.metrics.hits.inc();
        }
        for run in runs {
            self.fill_run(run)?;
        }

        // SAFETY: every block of `span` is present at this point, and present
        // bytes are never written again.
        Ok(unsafe { self.store.view(start..end) })
    }

    /// [`fetch_range`](Self::fetch_range) on the blocking thread pool, for async callers.
    pub async fn fetch_range_async(self: Arc<Self>, start: u64, end: u64) -> Result<Bytes, CacheError> {
        tokio::task::spawn_blocking(move || {
            self.fetch_range(start, end).map(Bytes::copy_from_slice)
        })
        .await?
    }

    /// Fill every block of the resource.
    pub fn prefetch(&self) -> Result<(), CacheError> {
        self.fetch_range(0, self.geometry.total_size()).map(|_| ())
    }

    /// Fetch the blocks of `run` that are still missing once it is locked.
    fn fill_run(&self, run: BlockSpan) -> Result<(), CacheError> {
        let _claim = self.pending.claim(run);
        let _lock = match self.locker.try_lock(run)? {
            Some(guard) => guard,
            None => {
                debug!(%run, "Run locked by another process, waiting");
                self.locker.lock(run)?
            }
        };

        let gaps = self.blockmap.missing_runs(run);
        if gaps.is_empty() {
            debug!(%run, "Run filled by another holder while waiting");
        }

        for gap in gaps {
            let bytes = self.geometry.byte_range(gap);
            debug!(%gap, start = bytes.start, end = bytes.end, "Fetching missing run");

            self.metrics.fetch_calls.inc();
            let data = fetch_exact(self.fetcher.as_ref(), bytes.start, bytes.end).map_err(
                |source| {
                    self.metrics.fetch_failures.inc();
                    warn!(start = bytes.start, end = bytes.end, error = %source, "Fetch failed");
                    CacheError::Fetch {
                        start: bytes.start,
                        end: bytes.end,
                        source,
                    }
                },
            )?;

            // SAFETY: the blocks of `gap` are absent and we hold both the
            // in-process claim and the cross-process lock covering them, so
            // no one else writes these bytes and no one reads them before
            // their bits are set below.
            unsafe { self.store.write_at(bytes.start, &data) };
            self.store.flush(bytes.clone(), self.config.sync_writes)?;

            self.blockmap.mark_present(gap);
            self.blockmap.flush(gap, self.config.sync_writes)?;
            self.metrics.fetched_bytes.inc_by(data.len() as u64);
        }

        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.geometry.total_size()
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size()
    }

    pub fn block_count(&self) -> u64 {
        self.geometry.block_count()
    }

    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether block `block` has been filled by any process.
    pub fn is_present(&self, block: u64) -> bool {
        block < self.geometry.block_count() && self.blockmap.is_present(block)
    }

    pub fn present_blocks(&self) -> u64 {
        self.blockmap.present_count()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_size: self.geometry.total_size(),
            block_size: self.geometry.block_size(),
            block_count: self.geometry.block_count(),
            present_blocks: self.blockmap.present_count(),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}
