//! Persistent blockmap stored in the side index file.
//!
//! The index file is a fixed header followed by one bit per block. It is
//! mapped shared, so a bit set by any process is visible to every other
//! process that has the same file mapped. Bits are only ever set, never
//! cleared: a present block stays present for the lifetime of the files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use bytemuck::{Pod, Zeroable};
use memmap2::MmapRaw;
use tracing::{debug, info};

use crate::cache::error::CacheError;
use crate::cache::range::{missing_runs, BlockGeometry, BlockSpan};

/// Magic bytes at the start of every index file.
pub const INDEX_MAGIC: [u8; 8] = *b"SMMAPIX1";

/// On-disk format version.
pub const INDEX_VERSION: u32 = 1;

/// Size of the fixed header preceding the bitmap.
pub const HEADER_SIZE: usize = 64;

/// Index file header.
///
/// Fields are ordered u64-first so `#[repr(C)]` introduces no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct IndexHeader {
    pub magic: [u8; 8],      // 0..8
    pub version: u32,        // 8..12
    pub flags: u32,          // 12..16
    pub total_size: u64,     // 16..24
    pub block_size: u64,     // 24..32
    pub block_count: u64,    // 32..40
    pub _reserved: [u8; 24], // 40..64
}

const _: () = assert!(std::mem::size_of::<IndexHeader>() == HEADER_SIZE);

impl IndexHeader {
    pub fn new(geometry: BlockGeometry) -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: INDEX_VERSION,
            flags: 0,
            total_size: geometry.total_size(),
            block_size: geometry.block_size(),
            block_count: geometry.block_count(),
            _reserved: [0; 24],
        }
    }

    /// Check the header against the geometry the caller expects.
    fn check(&self, path: &Path, geometry: BlockGeometry) -> Result<(), CacheError> {
        if self.magic != INDEX_MAGIC {
            return Err(CacheError::layout(path, "not a blockmap index file"));
        }
        if self.version != INDEX_VERSION {
            return Err(CacheError::layout(
                path,
                format!("unsupported index version {}", self.version),
            ));
        }
        if self.total_size != geometry.total_size() || self.block_size != geometry.block_size() {
            return Err(CacheError::layout(
                path,
                format!(
                    "index describes {} bytes in blocks of {}, expected {} bytes in blocks of {}",
                    self.total_size,
                    self.block_size,
                    geometry.total_size(),
                    geometry.block_size()
                ),
            ));
        }
        Ok(())
    }
}

/// Bytes needed for one bit per block.
pub fn bitmap_len(block_count: u64) -> usize {
    block_count.div_ceil(8) as usize
}

/// Summary of an index file, readable without opening the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexInfo {
    pub total_size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub present_blocks: u64,
}

impl IndexInfo {
    /// Fraction of blocks present (1.0 for an empty resource).
    pub fn fill_fraction(&self) -> f64 {
        if self.block_count == 0 {
            return 1.0;
        }
        self.present_blocks as f64 / self.block_count as f64
    }
}

/// Open (creating if needed) a file for shared read/write use.
pub(crate) fn open_shared_file(path: &Path) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::storage(parent, e))?;
        }
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| CacheError::storage(path, e))
}

/// The memory-mapped blockmap of one cache.
pub struct Blockmap {
    path: PathBuf,
    map: MmapRaw,
    bitmap_len: usize,
}

impl Blockmap {
    /// Initialize an empty index file or validate an existing one, then map it.
    ///
    /// The caller must hold the index file's init lock so that racing
    /// openers agree on who writes the header.
    pub fn load_or_create(
        path: &Path,
        file: &File,
        geometry: BlockGeometry,
    ) -> Result<Self, CacheError> {
        let bitmap_len = bitmap_len(geometry.block_count());
        let expected_len = (HEADER_SIZE + bitmap_len) as u64;
        let current_len = file
            .metadata()
            .map_err(|e| CacheError::storage(path, e))?
            .len();

        if current_len == 0 {
            let header = IndexHeader::new(geometry);
            let mut writer = file;
            writer
                .write_all(bytemuck::bytes_of(&header))
                .and_then(|_| file.set_len(expected_len))
                .and_then(|_| file.sync_all())
                .map_err(|e| CacheError::storage(path, e))?;
            info!(
                path = %path.display(),
                blocks = geometry.block_count(),
                block_size = geometry.block_size(),
                "Created blockmap index"
            );
        } else {
            let header = read_header(path, file)?;
            header.check(path, geometry)?;
            if current_len < expected_len {
                file.set_len(expected_len)
                    .map_err(|e| CacheError::storage(path, e))?;
            }
            debug!(path = %path.display(), "Reopened blockmap index");
        }

        let map = MmapRaw::map_raw(file).map_err(|e| CacheError::storage(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            map,
            bitmap_len,
        })
    }

    /// Read the header and count present blocks without mapping the file.
    pub fn inspect(path: &Path) -> Result<IndexInfo, CacheError> {
        let mut file = File::open(path).map_err(|e| CacheError::storage(path, e))?;
        let header = read_header(path, &file)?;
        if header.magic != INDEX_MAGIC {
            return Err(CacheError::layout(path, "not a blockmap index file"));
        }
        let mut bits = Vec::with_capacity(bitmap_len(header.block_count));
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))
            .and_then(|_| file.read_to_end(&mut bits))
            .map_err(|e| CacheError::storage(path, e))?;
        bits.truncate(bitmap_len(header.block_count));

        Ok(IndexInfo {
            total_size: header.total_size,
            block_size: header.block_size,
            block_count: header.block_count,
            present_blocks: bits.iter().map(|b| b.count_ones() as u64).sum(),
        })
    }

    fn bits(&self) -> &[AtomicU8] {
        // SAFETY: the mapping is at least HEADER_SIZE + bitmap_len bytes long
        // and lives as long as `self`. AtomicU8 has the same layout as u8, and
        // every access to these bytes in any process goes through atomics.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(HEADER_SIZE) as *const AtomicU8,
                self.bitmap_len,
            )
        }
    }

    /// Whether `block` has been filled. Pairs with the release in `mark_present`.
    pub fn is_present(&self, block: u64) -> bool {
        let byte = self.bits()[(block / 8) as usize].load(Ordering::Acquire);
        byte & (1 << (block % 8)) != 0
    }

    #[cfg(test)]
    fn all_present(&self, span: BlockSpan) -> bool {
        span.blocks().all(|b| self.is_present(b))
    }

    /// Maximal runs of absent blocks within `span`.
    pub fn missing_runs(&self, span: BlockSpan) -> Vec<BlockSpan> {
        missing_runs(span, |b| self.is_present(b))
    }

    /// Set the bits for every block in `span`.
    ///
    /// The blocks' bytes must already be written to the backing store.
    pub fn mark_present(&self, span: BlockSpan) {
        let bits = self.bits();
        let mut block = span.first;
        while block < span.end {
            let byte_idx = block / 8;
            let mut mask = 0u8;
            while block < span.end && block / 8 == byte_idx {
                mask |= 1 << (block % 8);
                block += 1;
            }
            bits[byte_idx as usize].fetch_or(mask, Ordering::Release);
        }
    }

    /// Number of present blocks.
    pub fn present_count(&self) -> u64 {
        self.bits()
            .iter()
            .map(|b| b.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }

    /// Write back the bitmap bytes covering `span`.
    pub fn flush(&self, span: BlockSpan, sync: bool) -> Result<(), CacheError> {
        if span.is_empty() {
            return Ok(());
        }
        let offset = HEADER_SIZE + (span.first / 8) as usize;
        let len = ((span.end - 1) / 8 - span.first / 8 + 1) as usize;
        let result = if sync {
            self.map.flush_range(offset, len)
        } else {
            self.map.flush_async_range(offset, len)
        };
        result.map_err(|e| CacheError::storage(&self.path, e))
    }
}

fn read_header(path: &Path, file: &File) -> Result<IndexHeader, CacheError> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut reader = file;
    reader
        .seek(SeekFrom::Start(0))
        .and_then(|_| reader.read_exact(&mut buf))
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CacheError::layout(path, "index file is shorter than its header")
            }
            _ => CacheError::storage(path, e),
        })?;
    Ok(bytemuck::pod_read_unaligned(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_map(path: &Path, geometry: BlockGeometry) -> Result<Blockmap, CacheError> {
        let file = open_shared_file(path)?;
        Blockmap::load_or_create(path, &file, geometry)
    }

    #[test]
    fn test_header_layout() {
        let header = IndexHeader::new(BlockGeometry::new(65536, 1024));
        let bytes = bytemuck::bytes_of(&header);
        assert_eq!(&bytes[..8], b"SMMAPIX1");
        assert_eq!(header.block_count, 64);
    }

    #[test]
    fn test_mark_and_query() {
        let tmp = TempDir::new().unwrap();
        let map = open_map(&tmp.path().join("idx"), BlockGeometry::new(20 * 1024, 1024)).unwrap();

        assert_eq!(map.present_count(), 0);
        map.mark_present(BlockSpan::new(6, 11));
        assert!(!map.is_present(5));
        assert!(map.is_present(6));
        assert!(map.is_present(10));
        assert!(!map.is_present(11));
        assert_eq!(map.present_count(), 5);
        assert!(map.all_present(BlockSpan::new(7, 9)));
        assert_eq!(
            map.missing_runs(BlockSpan::new(4, 13)),
            vec![BlockSpan::new(4, 6), BlockSpan::new(11, 13)]
        );
        map.flush(BlockSpan::new(6, 11), true).unwrap();
    }

    #[test]
    fn test_bits_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        let geometry = BlockGeometry::new(10_000, 512);

        {
            let map = open_map(&path, geometry).unwrap();
            map.mark_present(BlockSpan::new(0, 3));
            map.mark_present(BlockSpan::new(19, 20));
            map.flush(BlockSpan::new(0, 20), true).unwrap();
        }

        let map = open_map(&path, geometry).unwrap();
        assert!(map.all_present(BlockSpan::new(0, 3)));
        assert!(map.is_present(19));
        assert_eq!(map.present_count(), 4);

        let info = Blockmap::inspect(&path).unwrap();
        assert_eq!(info.block_count, 20);
        assert_eq!(info.present_blocks, 4);
    }

    #[test]
    fn test_reopen_with_other_geometry_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        open_map(&path, BlockGeometry::new(4096, 1024)).unwrap();

        let err = open_map(&path, BlockGeometry::new(4096, 512)).err().unwrap();
        assert!(matches!(err, CacheError::Layout { .. }));
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("idx");
        std::fs::write(&path, vec![7u8; 128]).unwrap();

        let err = open_map(&path, BlockGeometry::new(4096, 1024)).err().unwrap();
        assert!(matches!(err, CacheError::Layout { .. }));
    }
}
