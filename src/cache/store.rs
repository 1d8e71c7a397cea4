//! Memory-mapped backing file holding the cached bytes.
//!
//! The file is sized to the whole resource once, at open, and never grows
//! or shrinks afterwards. Bytes of absent blocks are whatever the file
//! happens to contain (zeroes for a fresh file) and must not be read.

use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::MmapRaw;
use tracing::{debug, info};

use crate::cache::blockmap::open_shared_file;
use crate::cache::error::CacheError;

/// Shared, fixed-length mapping of the backing file.
pub struct BackingStore {
    path: PathBuf,
    /// `None` for an empty resource: zero-length files cannot be mapped.
    map: Option<MmapRaw>,
    len: u64,
}

impl BackingStore {
    /// Open or create the backing file at `path` with exactly `len` bytes.
    ///
    /// With `must_exist`, previously cached bytes are expected in the file,
    /// so a missing or short file is an error rather than being resized.
    pub fn open(path: &Path, len: u64, must_exist: bool) -> Result<Self, CacheError> {
        let file = open_shared_file(path)?;
        let current_len = file
            .metadata()
            .map_err(|e| CacheError::storage(path, e))?
            .len();

        if current_len > len || (must_exist && current_len != len) {
            return Err(CacheError::layout(
                path,
                format!("backing file holds {current_len} bytes, expected {len}"),
            ));
        }
        if current_len < len {
            file.set_len(len).map_err(|e| CacheError::storage(path, e))?;
            info!(path = %path.display(), len, "Sized backing file");
        }

        let map = if len == 0 {
            None
        } else {
            Some(MmapRaw::map_raw(&file).map_err(|e| CacheError::storage(path, e))?)
        };

        debug!(path = %path.display(), len, "Mapped backing file");
        Ok(Self {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the mapping at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `[offset, offset + data.len())`
    /// across every thread and process sharing the file, and nobody may read
    /// that range until the write has completed.
    pub unsafe fn write_at(&self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        assert!(offset + data.len() as u64 <= self.len);
        if let Some(map) = &self.map {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                map.as_mut_ptr().add(offset as usize),
                data.len(),
            );
        }
    }

    /// View of the bytes in `range`.
    ///
    /// # Safety
    ///
    /// Every block overlapping `range` must be present: present bytes are
    /// never written again, so the returned slice cannot change under the
    /// caller.
    pub unsafe fn view(&self, range: Range<u64>) -> &[u8] {
        if range.is_empty() {
            return &[];
        }
        match &self.map {
            Some(map) => {
                assert!(range.end <= self.len);
                std::slice::from_raw_parts(
                    map.as_ptr().add(range.start as usize),
                    (range.end - range.start) as usize,
                )
            }
            None => &[],
        }
    }

    /// Write back the bytes in `range`, synchronously or not.
    pub fn flush(&self, range: Range<u64>, sync: bool) -> Result<(), CacheError> {
        let Some(map) = &self.map else {
            return Ok(());
        };
        if range.is_empty() {
            return Ok(());
        }
        let offset = range.start as usize;
        let len = (range.end - range.start) as usize;
        let result = if sync {
            map.flush_range(offset, len)
        } else {
            map.flush_async_range(offset, len)
        };
        result.map_err(|e| CacheError::storage(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_sizes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("data");

        let store = BackingStore::open(&path, 8192, false).unwrap();
        assert_eq!(store.len(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);

        BackingStore::open(&path, 8192, true).unwrap();
    }

    #[test]
    fn test_write_then_view() {
        let tmp = TempDir::new().unwrap();
        let store = BackingStore::open(&tmp.path().join("data"), 4096, false).unwrap();

        unsafe { store.write_at(1000, b"hello") };
        store.flush(1000..1005, true).unwrap();
        assert_eq!(unsafe { store.view(1000..1005) }, b"hello");
        assert!(unsafe { store.view(7..7) }.is_empty());
    }

    #[test]
    fn test_writes_visible_to_second_mapping() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        let a = BackingStore::open(&path, 1024, false).unwrap();
        let b = BackingStore::open(&path, 1024, true).unwrap();

        unsafe { a.write_at(0, &[9u8; 16]) };
        assert_eq!(unsafe { b.view(0..16) }, &[9u8; 16]);
    }

    #[test]
    fn test_larger_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        let err = BackingStore::open(&path, 1024, false).err().unwrap();
        assert!(matches!(err, CacheError::Layout { .. }));
    }

    #[test]
    fn test_missing_file_with_expected_contents_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");

        let err = BackingStore::open(&path, 1024, true).err().unwrap();
        assert!(matches!(err, CacheError::Layout { .. }));
        // The failed open must not leave a full-length file behind.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_empty_resource() {
        let tmp = TempDir::new().unwrap();
        let store = BackingStore::open(&tmp.path().join("data"), 0, false).unwrap();
        assert!(store.is_empty());
        store.flush(0..0, true).unwrap();
    }
}
